//! Semantic cache: exact-hash shortcut in KV, ANN fallback in the
//! time-series store. Every storage error on this path fails open; a
//! broken cache must never break the proxy.

use crate::embed::Embedder;
use crate::kv::KvStore;
use crate::tsdb::TsStore;
use crate::types::CacheHit;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Embedding input cap, in characters.
const EMBED_INPUT_CHARS: usize = 512;
/// Stored prompt text cap, in characters.
const STORED_PROMPT_CHARS: usize = 1000;

#[derive(Serialize, Deserialize)]
struct KvShortcut {
    cache_id: Uuid,
    response_text: String,
}

pub struct SemanticCache {
    kv: KvStore,
    tsdb: TsStore,
    embedder: Arc<dyn Embedder>,
    ttl_seconds: u64,
    similarity_threshold: f64,
}

impl SemanticCache {
    pub fn new(
        kv: KvStore,
        tsdb: TsStore,
        embedder: Arc<dyn Embedder>,
        ttl_seconds: u64,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            kv,
            tsdb,
            embedder,
            ttl_seconds,
            similarity_threshold,
        }
    }

    /// Stable cache key text for the supported upstream schemas. `None`
    /// means the request does not participate in caching.
    pub fn extract_prompt(body: &Value) -> Option<String> {
        if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
            let joined: Vec<String> = messages
                .iter()
                .map(|m| {
                    let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("");
                    let content = match m.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    format!("{role}:{content}")
                })
                .collect();
            return Some(joined.join("|"));
        }
        if let Some(prompt) = body.get("prompt").and_then(|p| p.as_str()) {
            return Some(prompt.to_string());
        }
        if let Some(prompt) = body.get("human_prompt").and_then(|p| p.as_str()) {
            return Some(prompt.to_string());
        }
        None
    }

    /// First 16 hex chars of SHA-256 over the prompt text.
    pub fn prompt_hash(prompt_text: &str) -> String {
        let digest = Sha256::digest(prompt_text.as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    /// Exact-hash lookup first, then ANN under the cosine threshold.
    pub async fn lookup(&self, org_id: Uuid, model: &str, prompt_text: &str) -> Option<CacheHit> {
        let hash = Self::prompt_hash(prompt_text);
        match self.kv.get(&shortcut_key(org_id, model, &hash)).await {
            Ok(Some(raw)) => {
                if let Ok(shortcut) = serde_json::from_str::<KvShortcut>(&raw) {
                    debug!(org = %org_id, model, "cache exact hit");
                    return Some(CacheHit {
                        cache_id: shortcut.cache_id,
                        response_text: shortcut.response_text,
                        similarity: 1.0,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => warn!("cache shortcut lookup failed: {e:#}"),
        }

        let embedding = match self.embedder.embed(&truncate_chars(prompt_text, EMBED_INPUT_CHARS)) {
            Ok(v) => v,
            Err(e) => {
                warn!("embedding failed, skipping ANN lookup: {e:#}");
                return None;
            }
        };

        match self
            .tsdb
            .cache_ann_lookup(org_id, model, &embedding, self.similarity_threshold)
            .await
        {
            Ok(Some((cache_id, response_text, distance))) => {
                debug!(org = %org_id, model, distance, "cache ANN hit");
                Some(CacheHit {
                    cache_id,
                    response_text,
                    similarity: 1.0 - distance,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("cache ANN lookup failed: {e:#}");
                None
            }
        }
    }

    /// Write both the durable row and the KV shortcut.
    pub async fn store(
        &self,
        org_id: Uuid,
        model: &str,
        prompt_text: &str,
        response_text: &str,
        response_tokens: Option<i64>,
    ) -> Result<Uuid> {
        let hash = Self::prompt_hash(prompt_text);
        let cache_id = Uuid::new_v4();
        let embedding = self
            .embedder
            .embed(&truncate_chars(prompt_text, EMBED_INPUT_CHARS))?;
        let expires_at = Utc::now() + Duration::seconds(self.ttl_seconds as i64);

        self.tsdb
            .cache_insert(
                cache_id,
                org_id,
                model,
                &hash,
                &embedding,
                &truncate_chars(prompt_text, STORED_PROMPT_CHARS),
                response_text,
                response_tokens,
                expires_at,
            )
            .await?;

        let shortcut = serde_json::to_string(&KvShortcut {
            cache_id,
            response_text: response_text.to_string(),
        })?;
        self.kv
            .set_ex(&shortcut_key(org_id, model, &hash), &shortcut, self.ttl_seconds)
            .await?;
        Ok(cache_id)
    }

    /// Hit accounting is best-effort; failures never surface.
    pub async fn record_hit(&self, cache_id: Uuid, cost_saved: f64) {
        if let Err(e) = self.tsdb.cache_record_hit(cache_id, cost_saved).await {
            warn!(%cache_id, "cache hit accounting failed: {e:#}");
        }
    }
}

fn shortcut_key(org_id: Uuid, model: &str, hash: &str) -> String {
    format!("cache:{org_id}:{model}:{hash}")
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_prompt_from_messages() {
        let body = json!({
            "model": "gpt-3.5-turbo",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "2+2?"}
            ]
        });
        assert_eq!(
            SemanticCache::extract_prompt(&body).unwrap(),
            "system:be terse|user:2+2?"
        );
    }

    #[test]
    fn test_extract_prompt_legacy_and_anthropic() {
        assert_eq!(
            SemanticCache::extract_prompt(&json!({"prompt": "hello"})).unwrap(),
            "hello"
        );
        assert_eq!(
            SemanticCache::extract_prompt(&json!({"human_prompt": "hi"})).unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_extract_prompt_none_for_unknown_schema() {
        assert!(SemanticCache::extract_prompt(&json!({"input": "x"})).is_none());
        assert!(SemanticCache::extract_prompt(&json!("just a string")).is_none());
    }

    #[test]
    fn test_extract_prompt_structured_content() {
        let body = json!({"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]});
        // Non-string content is serialized rather than dropped, keeping
        // the key stable for identical requests.
        let key = SemanticCache::extract_prompt(&body).unwrap();
        assert!(key.starts_with("user:["));
    }

    #[test]
    fn test_prompt_hash_is_16_hex_and_stable() {
        let a = SemanticCache::prompt_hash("what is two plus two");
        let b = SemanticCache::prompt_hash("what is two plus two");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, SemanticCache::prompt_hash("something else"));
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }
}
