//! Policy document, atomic snapshot swap, and file hot reload.
//!
//! Exactly one policy document is active at a time. Readers clone an
//! `Arc` snapshot; mutations build a new document and swap the pointer,
//! so the request path never observes a half-applied policy.

use crate::config::Config;
use crate::types::IntentCategory;
use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub block_pii: bool,
    pub block_destructive: bool,
    pub block_external_calls: bool,
    /// Empty list means every model is allowed.
    pub allowed_models: Vec<String>,
    pub max_tokens_per_request: Option<i64>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        PolicyRules {
            block_pii: true,
            block_destructive: true,
            block_external_calls: false,
            allowed_models: Vec::new(),
            max_tokens_per_request: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub policy_id: String,
    pub version: u64,
    pub max_burn_rate_per_hour: f64,
    pub blocked_intents: Vec<IntentCategory>,
    pub pii_masking_enabled: bool,
    pub shadow_mode: bool,
    pub rules: PolicyRules,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        PolicyDocument {
            policy_id: "policy-default".into(),
            version: 1,
            max_burn_rate_per_hour: 10.0,
            blocked_intents: Vec::new(),
            pii_masking_enabled: true,
            shadow_mode: false,
            rules: PolicyRules::default(),
        }
    }
}

impl PolicyDocument {
    /// Baseline document derived from the environment.
    pub fn from_config(config: &Config) -> Self {
        PolicyDocument {
            shadow_mode: config.shadow_mode,
            rules: PolicyRules {
                block_pii: config.firewall_block_pii,
                block_destructive: config.firewall_block_destructive,
                ..PolicyRules::default()
            },
            ..PolicyDocument::default()
        }
    }

    pub fn blocks_intent(&self, category: IntentCategory) -> bool {
        self.blocked_intents.contains(&category)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.rules.allowed_models.is_empty()
            || self.rules.allowed_models.iter().any(|m| m == model)
    }
}

/// Copy-on-write holder for the active policy.
pub struct PolicyStore {
    snapshot: RwLock<Arc<PolicyDocument>>,
}

impl PolicyStore {
    pub fn new(doc: PolicyDocument) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(doc)),
        }
    }

    pub fn current(&self) -> Arc<PolicyDocument> {
        self.snapshot.read().expect("policy lock poisoned").clone()
    }

    pub fn swap(&self, doc: PolicyDocument) -> Arc<PolicyDocument> {
        let doc = Arc::new(doc);
        *self.snapshot.write().expect("policy lock poisoned") = doc.clone();
        doc
    }

    /// Merge a partial JSON update onto the current document and bump the
    /// version. Last writer wins; there is no version precondition.
    pub fn apply_partial(&self, patch: &Value) -> Result<Arc<PolicyDocument>> {
        let current = self.current();
        let mut merged = serde_json::to_value(current.as_ref())?;
        merge_objects(&mut merged, patch);
        let mut doc: PolicyDocument =
            serde_json::from_value(merged).context("policy update does not fit the schema")?;
        doc.version = current.version + 1;
        Ok(self.swap(doc))
    }
}

fn merge_objects(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(slot) if slot.is_object() && v.is_object() => merge_objects(slot, v),
                    _ => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Parse a policy document from a JSON file.
pub fn load_from_file(path: &Path) -> Result<PolicyDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing policy file {}", path.display()))
}

/// Watch the policy file and swap the snapshot on change. The returned
/// watcher must be kept alive for the lifetime of the process.
pub fn spawn_watcher<F>(
    path: String,
    store: Arc<PolicyStore>,
    on_reload: F,
) -> Result<RecommendedWatcher>
where
    F: Fn(Arc<PolicyDocument>) + Send + Sync + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("policy watcher error: {e}"),
        }
    })?;
    watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;
    info!(path = %path, "watching policy file for changes");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match load_from_file(Path::new(&path)) {
                Ok(doc) => {
                    let version = doc.version;
                    let snapshot = store.swap(doc);
                    info!(version, "policy reloaded from file");
                    on_reload(snapshot);
                }
                Err(e) => warn!("policy reload skipped: {e:#}"),
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_update_merges_and_bumps_version() {
        let store = PolicyStore::new(PolicyDocument::default());
        let updated = store
            .apply_partial(&json!({
                "shadow_mode": true,
                "rules": {"block_external_calls": true}
            }))
            .unwrap();
        assert!(updated.shadow_mode);
        assert!(updated.rules.block_external_calls);
        // Untouched fields survive the merge.
        assert!(updated.rules.block_pii);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn test_swap_is_visible_to_readers() {
        let store = PolicyStore::new(PolicyDocument::default());
        let mut doc = PolicyDocument::default();
        doc.policy_id = "policy-next".into();
        store.swap(doc);
        assert_eq!(store.current().policy_id, "policy-next");
    }

    #[test]
    fn test_blocked_intent_lookup() {
        let mut doc = PolicyDocument::default();
        doc.blocked_intents = vec![IntentCategory::Destructive];
        assert!(doc.blocks_intent(IntentCategory::Destructive));
        assert!(!doc.blocks_intent(IntentCategory::DataAccess));
    }

    #[test]
    fn test_empty_allowed_models_allows_all() {
        let doc = PolicyDocument::default();
        assert!(doc.allows_model("gpt-4"));
        let mut restricted = PolicyDocument::default();
        restricted.rules.allowed_models = vec!["gpt-3.5-turbo".into()];
        assert!(restricted.allows_model("gpt-3.5-turbo"));
        assert!(!restricted.allows_model("gpt-4"));
    }

    #[test]
    fn test_bad_partial_update_rejected() {
        let store = PolicyStore::new(PolicyDocument::default());
        assert!(store.apply_partial(&json!({"version": "not-a-number"})).is_err());
        // Snapshot unchanged after a failed merge.
        assert_eq!(store.current().version, 1);
    }
}
