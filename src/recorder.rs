//! Flight recorder: trace capture with buffered batch writes.
//!
//! Denials take the immediate synchronous path so the audit row exists
//! before the 403 is written. Everything else lands in a bounded buffer
//! drained once per second, up to 100 rows per batch; a failed batch is
//! re-prepended for retry (duplicates are acceptable, rows carry unique
//! ids).

use crate::kv::KvStore;
use crate::tsdb::TsStore;
use crate::types::{
    extract_messages, extract_model, extract_tool_calls, extract_usage, AgentRequest, Decision,
    FirewallAction, Trace,
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

const FLUSH_INTERVAL_MS: u64 = 1000;
const FLUSH_BATCH_SIZE: usize = 100;
const BUFFER_CAP: usize = 10_000;
/// Reasoning steps are truncated to this many characters each.
const REASONING_STEP_CHARS: usize = 500;

// ── Cost table ──────────────────────────────────────────────────

lazy_static! {
    /// USD per token (input, output). Longest matching prefix wins so
    /// `gpt-4-turbo-2024-04-09` resolves to the turbo tier, not `gpt-4`.
    static ref MODEL_PRICES: Vec<(&'static str, f64, f64)> = vec![
        ("gpt-4-turbo", 1e-5, 3e-5),
        ("gpt-4", 3e-5, 6e-5),
        ("gpt-3.5-turbo", 5e-7, 1.5e-6),
        ("claude-3-opus", 1.5e-5, 7.5e-5),
        ("claude-3-sonnet", 3e-6, 1.5e-5),
        ("claude-3-haiku", 2.5e-7, 1.25e-6),
    ];
}

/// (input price, output price) for a model; unknown models fall back to
/// the gpt-3.5-turbo tier.
pub fn price_for(model: &str) -> (f64, f64) {
    MODEL_PRICES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or((5e-7, 1.5e-6))
}

pub fn derive_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let (pi, po) = price_for(model);
    input_tokens as f64 * pi + output_tokens as f64 * po
}

// ── Context & inputs ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    start: Instant,
}

pub struct RecordInput {
    pub request: AgentRequest,
    pub decision: Decision,
    /// `Value::Null` when no upstream response exists (denials).
    pub response_body: Value,
    pub model_provider: Option<String>,
    pub cache_hit: bool,
    pub custom_metadata: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct RecorderStats {
    pub received: u64,
    pub persisted: u64,
    pub retried: u64,
    pub dropped: u64,
    pub immediate: u64,
    pub queue_depth: usize,
}

// ── Recorder ────────────────────────────────────────────────────

pub struct FlightRecorder {
    tsdb: TsStore,
    kv: KvStore,
    buffer: Mutex<Vec<Trace>>,
    received: AtomicU64,
    persisted: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    immediate: AtomicU64,
}

impl FlightRecorder {
    pub fn new(tsdb: TsStore, kv: KvStore) -> Self {
        Self {
            tsdb,
            kv,
            buffer: Mutex::new(Vec::new()),
            received: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            immediate: AtomicU64::new(0),
        }
    }

    pub fn create_context(&self, parent_span_id: Option<Uuid>) -> TraceContext {
        TraceContext {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    /// Capture one trace. Denials are persisted synchronously before this
    /// returns; every other trace is enqueued for the background flush.
    pub async fn record(&self, ctx: &TraceContext, input: RecordInput) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let trace = self.build_trace(ctx, &input);

        // Side bookkeeping is best-effort and must not delay the caller's
        // response path meaningfully.
        self.upsert_agent(&input.request).await;
        self.bump_counters(&trace).await;

        match trace.action_taken {
            FirewallAction::Blocked | FirewallAction::ShadowBlocked => {
                self.immediate.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.tsdb.insert_trace(&trace).await {
                    // The only storage failure that escalates: the denial
                    // still returns 403, minus its audit row.
                    error!(trace_id = %trace.trace_id, "immediate denial trace write failed: {e:#}");
                } else {
                    self.persisted.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                let mut buffer = self.buffer.lock().expect("recorder buffer poisoned");
                if buffer.len() >= BUFFER_CAP {
                    buffer.remove(0);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                buffer.push(trace);
            }
        }
    }

    fn build_trace(&self, ctx: &TraceContext, input: &RecordInput) -> Trace {
        let req = &input.request;
        let decision = &input.decision;
        let model_name = extract_model(&req.body).map(String::from);

        let usage = extract_usage(&input.response_body);
        let input_tokens = usage.map(|(i, _)| i).or_else(|| estimate_input_tokens(&req.body));
        let output_tokens = usage.map(|(_, o)| o);

        let cost_usd = if input.cache_hit {
            Some(0.0)
        } else {
            match (model_name.as_deref(), input_tokens) {
                (Some(model), Some(i)) => Some(derive_cost(model, i, output_tokens.unwrap_or(0))),
                _ => None,
            }
        };

        Trace {
            trace_id: ctx.trace_id,
            span_id: ctx.span_id,
            parent_span_id: ctx.parent_span_id,
            ts: ctx.started_at,
            duration_ms: ctx.start.elapsed().as_secs_f64() * 1000.0,
            org_id: req.org_id,
            agent_id: req.agent_id.clone(),
            agent_name: req.agent_name.clone(),
            agent_framework: req.agent_framework.clone(),
            request_type: request_type(&req.path),
            intent_category: decision.intent_category,
            risk_score: decision.risk_score,
            model_provider: input.model_provider.clone(),
            model_name,
            input_tokens,
            output_tokens,
            cost_usd,
            request_body: req.body.clone(),
            response_body: input.response_body.clone(),
            reasoning_steps: extract_reasoning_steps(&req.body),
            tool_calls: extract_tool_calls(&input.response_body),
            policy_applied: decision.policy_id.clone(),
            action_taken: decision.action,
            block_reason: decision.reason.clone(),
            is_shadow_event: decision.is_shadow_event,
            client_ip: req.client_ip.clone(),
            user_agent: req.user_agent.clone(),
            custom_metadata: input.custom_metadata.clone(),
        }
    }

    async fn upsert_agent(&self, req: &AgentRequest) {
        let name = req.agent_name.clone().unwrap_or_else(|| req.agent_id.clone());
        if let Err(e) = self
            .tsdb
            .upsert_agent(&req.agent_id, req.org_id, &name, req.agent_framework.as_deref())
            .await
        {
            warn!(agent = %req.agent_id, "agent upsert failed: {e:#}");
        }
    }

    async fn bump_counters(&self, trace: &Trace) {
        let bucket = trace.ts.format("%Y%m%d%H%M").to_string();
        if let Some(cost) = trace.cost_usd {
            if cost > 0.0 {
                if let Err(e) = self
                    .kv
                    .incr_by_float(&format!("cost:{}:{bucket}", trace.org_id), cost, 7200)
                    .await
                {
                    warn!("burn counter update failed: {e:#}");
                }
            }
        }
        if let Err(e) = self
            .kv
            .incr_window(&format!("req:{}:{bucket}", trace.org_id), 7200)
            .await
        {
            warn!("request counter update failed: {e:#}");
        }
        // Rate counters are tracked per agent but never enforced.
        if let Err(e) = self
            .kv
            .incr_window(&format!("rate:{}:{bucket}", trace.agent_id), 120)
            .await
        {
            warn!("rate counter update failed: {e:#}");
        }
    }

    /// Splice off up to one batch and persist it. Returns the number of
    /// rows written. The buffer lock is never held across the write.
    pub async fn flush_once(&self) -> usize {
        let batch: Vec<Trace> = {
            let mut buffer = self.buffer.lock().expect("recorder buffer poisoned");
            let n = buffer.len().min(FLUSH_BATCH_SIZE);
            buffer.drain(..n).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        match self.tsdb.insert_traces(&batch).await {
            Ok(()) => {
                let n = batch.len();
                self.persisted.fetch_add(n as u64, Ordering::Relaxed);
                n
            }
            Err(e) => {
                warn!(batch = batch.len(), "trace batch write failed, re-queueing: {e:#}");
                self.retried.fetch_add(1, Ordering::Relaxed);
                let mut buffer = self.buffer.lock().expect("recorder buffer poisoned");
                // Preserve order: the failed batch goes back to the front.
                buffer.splice(0..0, batch);
                0
            }
        }
    }

    /// Final drain on shutdown: keep flushing until the buffer is empty
    /// or a write fails twice in a row.
    pub async fn drain(&self) {
        let mut failures = 0u32;
        loop {
            let pending = self.queue_depth();
            if pending == 0 {
                return;
            }
            if self.flush_once().await == 0 {
                failures += 1;
                if failures >= 2 {
                    warn!(pending, "shutdown drain abandoned with traces unflushed");
                    return;
                }
            } else {
                failures = 0;
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.buffer.lock().expect("recorder buffer poisoned").len()
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            immediate: self.immediate.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
        }
    }
}

/// Background flush, fired every second until shutdown.
pub fn spawn_flush_loop(recorder: Arc<FlightRecorder>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
        loop {
            ticker.tick().await;
            recorder.flush_once().await;
        }
    })
}

// ── Derivations ─────────────────────────────────────────────────

/// `ceil(serialized_messages_len / 4)` when the upstream reported no
/// usage block.
fn estimate_input_tokens(body: &Value) -> Option<i64> {
    let messages = extract_messages(body)?;
    let serialized = serde_json::to_string(messages).ok()?;
    Some(serialized.len().div_ceil(4) as i64)
}

/// Assistant messages in the request are the agent's visible reasoning.
fn extract_reasoning_steps(body: &Value) -> Vec<String> {
    extract_messages(body)
        .map(|messages| {
            messages
                .iter()
                .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some("assistant"))
                .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                .map(|c| c.chars().take(REASONING_STEP_CHARS).collect())
                .collect()
        })
        .unwrap_or_default()
}

fn request_type(path: &str) -> String {
    path.trim_start_matches("/v1/")
        .trim_matches('/')
        .replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_price_prefers_longest_prefix() {
        assert_eq!(price_for("gpt-4-turbo-2024-04-09"), (1e-5, 3e-5));
        assert_eq!(price_for("gpt-4"), (3e-5, 6e-5));
    }

    #[test]
    fn test_unknown_model_falls_back() {
        assert_eq!(price_for("mistral-large"), (5e-7, 1.5e-6));
    }

    #[test]
    fn test_derive_cost() {
        let cost = derive_cost("claude-3-haiku", 1000, 2000);
        assert!((cost - (1000.0 * 2.5e-7 + 2000.0 * 1.25e-6)).abs() < 1e-12);
    }

    #[test]
    fn test_estimate_input_tokens() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let serialized = serde_json::to_string(body.get("messages").unwrap()).unwrap();
        assert_eq!(
            estimate_input_tokens(&body),
            Some(serialized.len().div_ceil(4) as i64)
        );
        assert_eq!(estimate_input_tokens(&json!({"prompt": "hi"})), None);
    }

    #[test]
    fn test_reasoning_steps_from_assistant_messages() {
        let body = json!({"messages": [
            {"role": "user", "content": "question"},
            {"role": "assistant", "content": "step one"},
            {"role": "assistant", "content": "x".repeat(900)}
        ]});
        let steps = extract_reasoning_steps(&body);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0], "step one");
        assert_eq!(steps[1].chars().count(), REASONING_STEP_CHARS);
    }

    #[test]
    fn test_request_type_from_path() {
        assert_eq!(request_type("/v1/chat/completions"), "chat.completions");
        assert_eq!(request_type("/v1/embeddings"), "embeddings");
    }
}
