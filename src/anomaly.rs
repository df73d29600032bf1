//! Anomaly detector: periodic z-score scan over recent traces.
//!
//! Every minute, agents with enough 24 h history get a token baseline;
//! any trace from the last five minutes beyond three standard deviations
//! raises an anomaly. Each trace alerts at most once.

use crate::events::{EventFanout, EventType};
use crate::tsdb::{AgentBaseline, TsStore};
use crate::types::{Anomaly, AnomalyStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

const SCAN_INTERVAL_SECS: u64 = 60;
const MIN_TRACES_FOR_BASELINE: i64 = 10;
const RECENT_WINDOW_MINUTES: i64 = 5;
const Z_THRESHOLD: f64 = 3.0;
const Z_CRITICAL: f64 = 5.0;
/// Flagged trace ids are remembered this long; far beyond the scan
/// window, so overlap can never re-alert.
const SEEN_RETENTION_MINUTES: i64 = 15;

fn z_score(total_tokens: i64, baseline: &AgentBaseline) -> Option<f64> {
    if baseline.stddev_tokens <= 0.0 {
        return None;
    }
    Some((total_tokens as f64 - baseline.mean_tokens) / baseline.stddev_tokens)
}

fn severity_for(z: f64) -> &'static str {
    if z > Z_CRITICAL {
        "critical"
    } else {
        "high"
    }
}

/// Dedupe set with time-based eviction.
struct SeenTraces {
    set: HashSet<Uuid>,
    order: VecDeque<(Uuid, DateTime<Utc>)>,
}

impl SeenTraces {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` when the trace was already flagged.
    fn insert(&mut self, trace_id: Uuid, ts: DateTime<Utc>) -> bool {
        if !self.set.insert(trace_id) {
            return false;
        }
        self.order.push_back((trace_id, ts));
        true
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::minutes(SEEN_RETENTION_MINUTES);
        while let Some((id, ts)) = self.order.front().copied() {
            if ts >= cutoff {
                break;
            }
            self.order.pop_front();
            self.set.remove(&id);
        }
    }
}

pub fn spawn_detector(tsdb: TsStore, fanout: Arc<EventFanout>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen = SeenTraces::new();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(SCAN_INTERVAL_SECS));
        // The immediate first tick would scan an empty window at boot.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            seen.prune(Utc::now());
            if let Err(e) = scan_once(&tsdb, &fanout, &mut seen).await {
                warn!("anomaly scan failed: {e:#}");
            }
        }
    })
}

async fn scan_once(
    tsdb: &TsStore,
    fanout: &EventFanout,
    seen: &mut SeenTraces,
) -> anyhow::Result<usize> {
    let baselines: HashMap<String, AgentBaseline> = tsdb
        .agent_baselines(MIN_TRACES_FOR_BASELINE)
        .await?
        .into_iter()
        .map(|b| (b.agent_id.clone(), b))
        .collect();
    if baselines.is_empty() {
        return Ok(0);
    }

    let mut raised = 0usize;
    for trace in tsdb.recent_token_counts(RECENT_WINDOW_MINUTES).await? {
        let Some(baseline) = baselines.get(&trace.agent_id) else {
            continue;
        };
        let Some(z) = z_score(trace.total_tokens, baseline) else {
            continue;
        };
        if z <= Z_THRESHOLD {
            continue;
        }
        if !seen.insert(trace.trace_id, trace.ts) {
            continue;
        }

        let severity = severity_for(z);
        let anomaly = Anomaly {
            anomaly_id: Uuid::new_v4(),
            org_id: trace.org_id,
            agent_id: trace.agent_id.clone(),
            anomaly_type: "token_usage_spike".into(),
            severity: severity.into(),
            details: json!({
                "traceId": trace.trace_id,
                "totalTokens": trace.total_tokens,
                "meanTokens": baseline.mean_tokens,
                "stddevTokens": baseline.stddev_tokens,
                "zScore": z,
            }),
            detected_at: Utc::now(),
            status: AnomalyStatus::Active,
            resolved_at: None,
            resolved_by: None,
        };

        if let Err(e) = tsdb.insert_anomaly(&anomaly).await {
            warn!(agent = %anomaly.agent_id, "anomaly persist failed: {e:#}");
        }
        fanout.emit(
            EventType::AnomalyDetected,
            Some(anomaly.org_id),
            json!({
                "anomalyId": anomaly.anomaly_id,
                "agentId": anomaly.agent_id,
                "type": anomaly.anomaly_type,
                "severity": anomaly.severity,
                "details": anomaly.details,
            }),
        );
        info!(
            agent = %anomaly.agent_id,
            z_score = z,
            severity,
            "token usage anomaly detected"
        );
        raised += 1;
    }
    Ok(raised)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(mean: f64, stddev: f64) -> AgentBaseline {
        AgentBaseline {
            org_id: Uuid::new_v4(),
            agent_id: "a1".into(),
            mean_tokens: mean,
            stddev_tokens: stddev,
            trace_count: 50,
        }
    }

    #[test]
    fn test_z_score() {
        let b = baseline(100.0, 20.0);
        assert_eq!(z_score(160, &b), Some(3.0));
        assert_eq!(z_score(100, &b), Some(0.0));
    }

    #[test]
    fn test_zero_stddev_never_alerts() {
        let b = baseline(100.0, 0.0);
        assert_eq!(z_score(10_000, &b), None);
    }

    #[test]
    fn test_severity_boundaries() {
        assert_eq!(severity_for(3.5), "high");
        assert_eq!(severity_for(5.0), "high");
        assert_eq!(severity_for(5.1), "critical");
    }

    #[test]
    fn test_seen_dedupe() {
        let mut seen = SeenTraces::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        assert!(seen.insert(id, now));
        assert!(!seen.insert(id, now));
    }

    #[test]
    fn test_seen_prune_evicts_old_entries() {
        let mut seen = SeenTraces::new();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let now = Utc::now();
        seen.insert(old, now - ChronoDuration::minutes(SEEN_RETENTION_MINUTES + 5));
        seen.insert(fresh, now);
        seen.prune(now);
        // The old id can alert again after eviction; the fresh one cannot.
        assert!(seen.insert(old, now));
        assert!(!seen.insert(fresh, now));
    }
}
