//! Proxy orchestrator: the `/v1/*` hot path.
//!
//! decode → tenant lookup → emergency stop → pre-hooks → firewall →
//! lock → cache → upstream → post-hooks → record → release → respond.

use crate::cache::SemanticCache;
use crate::error::AppError;
use crate::events::EventType;
use crate::recorder::{derive_cost, RecordInput};
use crate::state::AppState;
use crate::traffic::{self, LockGuard};
use crate::types::{
    extract_model, extract_usage, AgentRequest, Decision, Organization, Resolution,
};
use crate::workers::WorkerTrigger;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Queued conflicts wait at most this long before proceeding.
const MAX_QUEUE_WAIT_MS: u64 = 5000;
/// Cached org lookups expire quickly so revocations propagate.
const ORG_CACHE_TTL_SECS: u64 = 300;

const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let started = Instant::now();

    if state.traffic.emergency.is_stopped() {
        return Err(AppError::EmergencyStop);
    }

    // ── Tenant lookup ───────────────────────────────────────────
    let token = header_str(&headers, "x-switchboard-token").ok_or(AppError::MissingToken)?;
    let org = resolve_org(&state, &token).await?;

    if state.paused_all.load(Ordering::SeqCst) {
        return Err(AppError::AgentSuspended("paused"));
    }

    let agent_id = header_str(&headers, "x-agent-id").unwrap_or_else(|| "unattributed".into());
    match state.tsdb.agent_status(&agent_id).await {
        Ok(Some(status)) if !matches!(status, crate::types::AgentStatus::Active | crate::types::AgentStatus::Warning) => {
            return Err(AppError::AgentSuspended(status.as_str()));
        }
        Ok(_) => {}
        Err(e) => warn!(agent = %agent_id, "agent status lookup failed, proceeding: {e:#}"),
    }

    // ── Request context ─────────────────────────────────────────
    let parsed_body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let ctx = state.recorder.create_context(None);
    let mut req = AgentRequest {
        trace_id: ctx.trace_id,
        org_id: org.org_id,
        agent_id: agent_id.clone(),
        agent_name: header_str(&headers, "x-agent-name"),
        agent_framework: header_str(&headers, "x-agent-framework"),
        method: method.to_string(),
        path: uri.path().to_string(),
        body: parsed_body,
        client_ip: client_ip(&headers, addr),
        user_agent: header_str(&headers, "user-agent"),
        received_at: Utc::now(),
    };

    let env = worker_env(&req);

    // ── Pre-request hooks ───────────────────────────────────────
    let pre = state
        .workers
        .run_chain(WorkerTrigger::PreRequest, req.body.clone(), None, env.clone())
        .await;
    req.body = pre.request;
    if let Some(canned) = pre.short_circuit {
        let decision = Decision::allow(0.0);
        state
            .recorder
            .record(
                &ctx,
                RecordInput {
                    request: req.clone(),
                    decision: decision.clone(),
                    response_body: canned.clone(),
                    model_provider: None,
                    cache_hit: false,
                    custom_metadata: json!({
                        "short_circuit_worker": pre.short_circuit_worker,
                    }),
                },
            )
            .await;
        let bytes = serde_json::to_vec(&canned).unwrap_or_default();
        return Ok(decorate(
            json_response(StatusCode::OK, bytes),
            &ctx.trace_id,
            started,
            &decision,
            false,
        ));
    }

    // ── Firewall ────────────────────────────────────────────────
    let decision = state.firewall.evaluate(&req);
    if !decision.allowed {
        let reason = decision
            .reason
            .clone()
            .unwrap_or_else(|| "blocked by firewall".into());
        // Immediate path: the denial trace is persisted before the 403
        // goes out.
        state
            .recorder
            .record(
                &ctx,
                RecordInput {
                    request: req.clone(),
                    decision: decision.clone(),
                    response_body: Value::Null,
                    model_provider: None,
                    cache_hit: false,
                    custom_metadata: Value::Object(Default::default()),
                },
            )
            .await;
        state.fanout.emit(
            EventType::AgentBlocked,
            Some(org.org_id),
            json!({
                "agentId": req.agent_id,
                "traceId": ctx.trace_id,
                "reason": reason,
                "riskScore": decision.risk_score,
            }),
        );
        info!(trace = %ctx.trace_id, agent = %req.agent_id, %reason, "request blocked");
        let resp = AppError::PolicyViolation(reason).into_response();
        return Ok(decorate(resp, &ctx.trace_id, started, &decision, false));
    }
    if let Some(redacted) = decision.redacted_body.clone() {
        req.body = redacted;
    }

    // ── Resource locking ────────────────────────────────────────
    let body_text = serde_json::to_string(&req.body).unwrap_or_default();
    let mut guard: Option<LockGuard> = None;
    if let Some((rtype, rpath)) = traffic::extract_resource(&body_text) {
        let is_write = traffic::is_write_operation(&body_text, req.method.as_str());
        match state
            .traffic
            .request_access(&req.agent_id, rtype, &rpath, is_write)
            .await
        {
            Ok(access) => match access.resolution {
                Resolution::Rejected => return Err(AppError::ResourceLocked),
                Resolution::Queued => {
                    let wait = access.wait_ms.unwrap_or(100).min(MAX_QUEUE_WAIT_MS);
                    info!(resource = %rpath, wait_ms = wait, "queued on resource lock");
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Resolution::Granted => {
                    if access.lock.is_some() {
                        guard = Some(state.traffic.guard(&req.agent_id, rtype, &rpath));
                    }
                }
            },
            Err(e) => warn!("lock resolution failed, proceeding unlocked: {e:#}"),
        }
    }

    // ── Cache lookup / upstream fetch ───────────────────────────
    let prompt_key = SemanticCache::extract_prompt(&req.body);
    let model = extract_model(&req.body).map(String::from);
    let (provider, base_url) = select_upstream(&state, &headers);

    let mut cache_hit = false;
    let (status, resp_headers, resp_bytes) = match (&prompt_key, &model) {
        (Some(key), Some(model_name)) => {
            match state.cache.lookup(org.org_id, model_name, key).await {
                Some(hit) => {
                    cache_hit = true;
                    let saved = derive_cost(
                        model_name,
                        (key.len() / 4) as i64,
                        (hit.response_text.len() / 4) as i64,
                    );
                    state.cache.record_hit(hit.cache_id, saved).await;
                    let mut cached_headers = HeaderMap::new();
                    cached_headers
                        .insert("content-type", HeaderValue::from_static("application/json"));
                    (StatusCode::OK, cached_headers, Bytes::from(hit.response_text))
                }
                None => forward_upstream(&state, &method, &uri, &headers, &req, &base_url, &body).await?,
            }
        }
        _ => forward_upstream(&state, &method, &uri, &headers, &req, &base_url, &body).await?,
    };

    let mut response_json: Value = serde_json::from_slice(&resp_bytes).unwrap_or(Value::Null);

    // Store on a fresh 200 from upstream, best effort.
    if !cache_hit && status == StatusCode::OK {
        if let (Some(key), Some(model_name)) = (&prompt_key, &model) {
            let response_tokens = extract_usage(&response_json).map(|(_, o)| o);
            let text = String::from_utf8_lossy(&resp_bytes).into_owned();
            if let Err(e) = state
                .cache
                .store(org.org_id, model_name, key, &text, response_tokens)
                .await
            {
                warn!("cache store failed: {e:#}");
            }
        }
    }

    // ── Post-response hooks ─────────────────────────────────────
    let post = state
        .workers
        .run_chain(
            WorkerTrigger::PostResponse,
            req.body.clone(),
            Some(response_json.clone()),
            env,
        )
        .await;
    let mut out_bytes = resp_bytes;
    if let Some(modified) = post.response {
        if modified != response_json {
            out_bytes = Bytes::from(serde_json::to_vec(&modified).unwrap_or_default());
            response_json = modified;
        }
    }

    // ── Record & release ────────────────────────────────────────
    state
        .recorder
        .record(
            &ctx,
            RecordInput {
                request: req.clone(),
                decision: decision.clone(),
                response_body: response_json,
                model_provider: Some(provider.to_string()),
                cache_hit,
                custom_metadata: json!({"upstream_status": status.as_u16()}),
            },
        )
        .await;
    state.fanout.emit(
        EventType::TraceEvent,
        Some(org.org_id),
        json!({
            "traceId": ctx.trace_id,
            "agentId": req.agent_id,
            "action": decision.action.as_str(),
            "riskScore": decision.risk_score,
            "cacheHit": cache_hit,
        }),
    );

    if let Some(guard) = guard {
        guard.release().await;
    }

    // ── Decorated response ──────────────────────────────────────
    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower.starts_with("x-switchboard-") {
            continue;
        }
        builder = builder.header(name, value);
    }
    let resp = builder
        .body(Body::from(out_bytes))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("response build failed: {e}")))?;
    Ok(decorate(resp, &ctx.trace_id, started, &decision, cache_hit))
}

// ── Helpers ─────────────────────────────────────────────────────

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .unwrap_or_else(|| addr.ip().to_string())
}

fn worker_env(req: &AgentRequest) -> HashMap<String, String> {
    HashMap::from([
        ("org_id".to_string(), req.org_id.to_string()),
        ("agent_id".to_string(), req.agent_id.clone()),
        ("trace_id".to_string(), req.trace_id.to_string()),
        ("path".to_string(), req.path.clone()),
    ])
}

async fn resolve_org(state: &AppState, token: &str) -> Result<Organization, AppError> {
    let cache_key = format!("org:token:{token}");
    match state.kv.get(&cache_key).await {
        Ok(Some(raw)) => {
            if let Ok(org) = serde_json::from_str::<Organization>(&raw) {
                if !org.is_active {
                    return Err(AppError::InvalidToken);
                }
                return Ok(org);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("org cache lookup failed: {e:#}"),
    }

    let org = state
        .tsdb
        .org_by_token(token)
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::InvalidToken)?;

    if let Ok(raw) = serde_json::to_string(&org) {
        if let Err(e) = state.kv.set_ex(&cache_key, &raw, ORG_CACHE_TTL_SECS).await {
            warn!("org cache write failed: {e:#}");
        }
    }
    Ok(org)
}

/// Pick the upstream by the caller's Authorization prefix.
fn select_upstream(state: &AppState, headers: &HeaderMap) -> (&'static str, String) {
    let auth = header_str(headers, "authorization").unwrap_or_default();
    let bare = auth.strip_prefix("Bearer ").unwrap_or(&auth);
    if bare.starts_with("sk-ant-") {
        ("anthropic", state.config.upstream_anthropic.clone())
    } else if bare.starts_with("AIza") {
        ("google", state.config.upstream_google.clone())
    } else {
        ("openai", state.config.upstream_openai.clone())
    }
}

async fn forward_upstream(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    req: &AgentRequest,
    base_url: &str,
    original_body: &Bytes,
) -> Result<(StatusCode, HeaderMap, Bytes), AppError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);

    // A redacted body is forwarded instead of the caller's original.
    let body = if req.body != Value::Null
        && serde_json::from_slice::<Value>(original_body).map(|v| v != req.body).unwrap_or(true)
    {
        serde_json::to_vec(&req.body).unwrap_or_else(|_| original_body.to_vec())
    } else {
        original_body.to_vec()
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid method: {e}")))?;

    let mut upstream_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower.starts_with("x-switchboard-") {
            continue;
        }
        let Ok(h_name) = reqwest::header::HeaderName::from_bytes(lower.as_bytes()) else {
            continue;
        };
        let Ok(h_value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) else {
            continue;
        };
        upstream_headers.append(h_name, h_value);
    }

    let sent = state
        .http
        .request(reqwest_method, url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    let status =
        StatusCode::from_u16(sent.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out_headers = HeaderMap::new();
    for (name, value) in sent.headers().iter() {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out_headers.append(n, v);
        }
    }
    let bytes = sent
        .bytes()
        .await
        .map_err(|e| AppError::Upstream(format!("upstream body read failed: {e}")))?;
    Ok((status, out_headers, bytes))
}

fn json_response(status: StatusCode, bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Attach the switchboard response headers.
fn decorate(
    mut resp: Response,
    trace_id: &Uuid,
    started: Instant,
    decision: &Decision,
    cache_hit: bool,
) -> Response {
    let headers = resp.headers_mut();
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    set(headers, "x-switchboard-trace-id", trace_id.to_string());
    set(headers, "x-switchboard-latency-ms", format!("{latency_ms:.1}"));
    set(headers, "x-switchboard-risk-score", format!("{:.0}", decision.risk_score));
    set(
        headers,
        "x-switchboard-cache",
        if cache_hit { "HIT" } else { "MISS" }.to_string(),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_list_is_lowercase() {
        assert!(HOP_BY_HOP.iter().all(|h| h.chars().all(|c| c.is_ascii_lowercase() || c == '-')));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, addr), "10.1.2.3");
        assert_eq!(client_ip(&HeaderMap::new(), addr), "127.0.0.1");
    }
}
