//! Traffic controller: logical resource locks and the emergency stop.
//!
//! Locks live in the KV store under `lock:{hash}` with the holder agent
//! id as value and a TTL; expiry is authoritative. Writes take the lock,
//! reads never block.

use crate::kv::KvStore;
use crate::types::{AccessResult, Resolution, ResourceLock, ResourceType};
use anyhow::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A write lock about to expire within this window queues the contender
/// instead of rejecting it.
const QUEUE_WINDOW_SECS: i64 = 5;

// ── Emergency stop ──────────────────────────────────────────────

/// Process-wide kill switch. While engaged, every call path entering the
/// orchestrator short-circuits with a 503-equivalent response.
#[derive(Clone, Default)]
pub struct EmergencyStop {
    engaged: Arc<AtomicBool>,
}

impl EmergencyStop {
    pub fn new(engaged: bool) -> Self {
        Self {
            engaged: Arc::new(AtomicBool::new(engaged)),
        }
    }

    pub fn trigger(&self) {
        self.engaged.store(true, Ordering::SeqCst);
        warn!("EMERGENCY STOP engaged, all proxy traffic halted");
    }

    pub fn reset(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        info!("emergency stop reset, proxy traffic resumed");
    }

    pub fn is_stopped(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

// ── Resource extraction heuristics ──────────────────────────────

lazy_static! {
    static ref DB_TABLE_RE: Regex =
        Regex::new(r"(?i)\b(?:from|into|update|join|table)\s+([A-Za-z_][A-Za-z0-9_]{1,63})")
            .unwrap();
    static ref FILE_RE: Regex =
        Regex::new(r#"(?i)["']?(?:file(?:_?path)?|path)["']?\s*[:=]\s*["']([^"']+)["']"#).unwrap();
    static ref ENDPOINT_RE: Regex =
        Regex::new(r#"(?i)["']?(?:url|endpoint)["']?\s*[:=]\s*["'](https?://[^"']+)["']"#).unwrap();
    static ref WRITE_VERBS: Vec<&'static str> = vec![
        "insert", "update", "delete", "upsert", "write", "create", "drop", "alter", "truncate",
        "save",
    ];
}

/// First matching resource reference in the serialized body. Order:
/// database table, file, API endpoint.
pub fn extract_resource(body_text: &str) -> Option<(ResourceType, String)> {
    if let Some(c) = DB_TABLE_RE.captures(body_text) {
        return Some((ResourceType::DatabaseTable, c[1].to_lowercase()));
    }
    if let Some(c) = FILE_RE.captures(body_text) {
        return Some((ResourceType::File, c[1].to_string()));
    }
    if let Some(c) = ENDPOINT_RE.captures(body_text) {
        return Some((ResourceType::ApiEndpoint, c[1].to_string()));
    }
    None
}

/// Mutating HTTP methods are writes; otherwise fall back to a substring
/// scan for write verbs.
pub fn is_write_operation(body_text: &str, method: &str) -> bool {
    if matches!(method, "POST" | "PUT" | "PATCH" | "DELETE") {
        return true;
    }
    let lower = body_text.to_lowercase();
    WRITE_VERBS.iter().any(|v| lower.contains(v))
}

/// First 16 hex chars of SHA-256 over `"type:path"`.
pub fn resource_hash(rtype: ResourceType, rpath: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", rtype.as_str(), rpath).as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ── Controller ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct TrafficController {
    kv: KvStore,
    lock_ttl_seconds: u64,
    max_queue_depth: u32,
    pub emergency: EmergencyStop,
}

impl TrafficController {
    pub fn new(
        kv: KvStore,
        lock_ttl_seconds: u64,
        max_queue_depth: u32,
        emergency: EmergencyStop,
    ) -> Self {
        Self {
            kv,
            lock_ttl_seconds,
            max_queue_depth,
            emergency,
        }
    }

    /// Resolve access to a logical resource for one agent.
    pub async fn request_access(
        &self,
        agent_id: &str,
        rtype: ResourceType,
        rpath: &str,
        is_write: bool,
    ) -> Result<AccessResult> {
        let hash = resource_hash(rtype, rpath);
        let key = lock_key(&hash);

        if !is_write {
            // Reads never block; flag possibly-stale data under a live
            // write lock held by someone else.
            let reason = match self.kv.get(&key).await? {
                Some(holder) if holder != agent_id => {
                    Some("may see stale data: resource under write lock".to_string())
                }
                _ => None,
            };
            return Ok(AccessResult {
                resolution: Resolution::Granted,
                lock: None,
                wait_ms: None,
                reason,
            });
        }

        if self.kv.set_nx_ex(&key, agent_id, self.lock_ttl_seconds).await? {
            return Ok(AccessResult {
                resolution: Resolution::Granted,
                lock: Some(ResourceLock {
                    resource_hash: hash,
                    holder_agent_id: agent_id.to_string(),
                    acquired_at: Utc::now(),
                    ttl_seconds: self.lock_ttl_seconds,
                }),
                wait_ms: None,
                reason: None,
            });
        }

        // Lost the race; resolve against the current holder.
        match self.kv.get(&key).await? {
            Some(holder) if holder == agent_id => Ok(AccessResult {
                resolution: Resolution::Granted,
                lock: None,
                wait_ms: None,
                reason: Some("re-entrant access by lock holder".to_string()),
            }),
            Some(holder) => {
                let remaining = self.kv.ttl_secs(&key).await?.unwrap_or(0);
                if remaining <= QUEUE_WINDOW_SECS {
                    // Bound the number of waiters parked on one resource.
                    let waiting = self
                        .kv
                        .incr_window(&format!("queue:{hash}"), QUEUE_WINDOW_SECS + 5)
                        .await?;
                    if waiting > self.max_queue_depth as i64 {
                        return Ok(AccessResult {
                            resolution: Resolution::Rejected,
                            lock: None,
                            wait_ms: None,
                            reason: Some(format!("queue full for resource held by {holder}")),
                        });
                    }
                    Ok(AccessResult {
                        resolution: Resolution::Queued,
                        lock: None,
                        wait_ms: Some((remaining.max(0) as u64) * 1000 + 100),
                        reason: Some(format!("lock held by {holder} expires soon")),
                    })
                } else {
                    Ok(AccessResult {
                        resolution: Resolution::Rejected,
                        lock: None,
                        wait_ms: None,
                        reason: Some(format!("resource locked by {holder}")),
                    })
                }
            }
            // Holder vanished between SET NX and GET; retry once.
            None => {
                let acquired = self.kv.set_nx_ex(&key, agent_id, self.lock_ttl_seconds).await?;
                Ok(AccessResult {
                    resolution: if acquired {
                        Resolution::Granted
                    } else {
                        Resolution::Queued
                    },
                    lock: acquired.then(|| ResourceLock {
                        resource_hash: hash,
                        holder_agent_id: agent_id.to_string(),
                        acquired_at: Utc::now(),
                        ttl_seconds: self.lock_ttl_seconds,
                    }),
                    wait_ms: (!acquired).then_some(100),
                    reason: None,
                })
            }
        }
    }

    /// Release requires holder identity match; mismatch is a no-op.
    pub async fn release_access(
        &self,
        agent_id: &str,
        rtype: ResourceType,
        rpath: &str,
    ) -> Result<bool> {
        let key = lock_key(&resource_hash(rtype, rpath));
        match self.kv.get(&key).await? {
            Some(holder) if holder == agent_id => {
                self.kv.del(&key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Scoped lock handle: releasing on drop keeps the "locks are never
    /// held indefinitely" invariant even when the caller disconnects
    /// mid-request. Drop spawns the release; expiry backstops it.
    pub fn guard(&self, agent_id: &str, rtype: ResourceType, rpath: &str) -> LockGuard {
        LockGuard {
            controller: self.clone(),
            agent_id: agent_id.to_string(),
            rtype,
            rpath: rpath.to_string(),
            released: false,
        }
    }
}

fn lock_key(hash: &str) -> String {
    format!("lock:{hash}")
}

pub struct LockGuard {
    controller: TrafficController,
    agent_id: String,
    rtype: ResourceType,
    rpath: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> bool {
        self.released = true;
        self.controller
            .release_access(&self.agent_id, self.rtype, &self.rpath)
            .await
            .unwrap_or(false)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let controller = self.controller.clone();
            let agent_id = std::mem::take(&mut self.agent_id);
            let rtype = self.rtype;
            let rpath = std::mem::take(&mut self.rpath);
            tokio::spawn(async move {
                if let Err(e) = controller.release_access(&agent_id, rtype, &rpath).await {
                    warn!("lock release on drop failed: {e:#}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_hash_is_16_hex() {
        let h = resource_hash(ResourceType::DatabaseTable, "accounts");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_resource_hash_deterministic_and_distinct() {
        let a = resource_hash(ResourceType::DatabaseTable, "accounts");
        let b = resource_hash(ResourceType::DatabaseTable, "accounts");
        let c = resource_hash(ResourceType::File, "accounts");
        assert_eq!(a, b);
        assert_ne!(a, c, "type participates in the hash");
    }

    #[test]
    fn test_extract_database_table() {
        let got = extract_resource(r#"{"messages":[{"content":"UPDATE accounts SET balance = 0"}]}"#);
        assert_eq!(got, Some((ResourceType::DatabaseTable, "accounts".into())));
    }

    #[test]
    fn test_extract_file_assignment() {
        let got = extract_resource(r#"{"file": "/etc/app/config.yml"}"#);
        assert_eq!(got, Some((ResourceType::File, "/etc/app/config.yml".into())));
    }

    #[test]
    fn test_extract_endpoint_assignment() {
        let got = extract_resource(r#"{"url": "https://api.example.com/v2/orders"}"#);
        assert_eq!(
            got,
            Some((ResourceType::ApiEndpoint, "https://api.example.com/v2/orders".into()))
        );
    }

    #[test]
    fn test_extract_order_prefers_tables() {
        // Both a table reference and a file assignment present; the table
        // heuristic runs first.
        let got = extract_resource(r#"{"q": "SELECT * FROM ledger", "file": "/tmp/x"}"#);
        assert_eq!(got, Some((ResourceType::DatabaseTable, "ledger".into())));
    }

    #[test]
    fn test_extract_none() {
        assert_eq!(extract_resource("hello world"), None);
    }

    #[test]
    fn test_write_detection_by_method() {
        assert!(is_write_operation("", "POST"));
        assert!(is_write_operation("", "DELETE"));
        assert!(!is_write_operation("tell me a joke", "GET"));
    }

    #[test]
    fn test_write_detection_by_verb() {
        assert!(is_write_operation("please INSERT a row", "GET"));
        assert!(is_write_operation("truncate the table", "GET"));
    }

    #[test]
    fn test_emergency_stop_toggles() {
        let stop = EmergencyStop::new(false);
        assert!(!stop.is_stopped());
        stop.trigger();
        assert!(stop.is_stopped());
        stop.reset();
        assert!(!stop.is_stopped());
    }
}
