//! Core data model shared across the proxy pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Request context ─────────────────────────────────────────────

/// One in-flight request as seen by the pipeline. Owned by the
/// orchestrator for the lifetime of the call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub trace_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub agent_framework: Option<String>,
    pub method: String,
    pub path: String,
    /// Parsed request body; `Value::Null` when the payload is not JSON.
    pub body: Value,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

// ── Firewall decision ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallAction {
    Allowed,
    Audited,
    Modified,
    Blocked,
    ShadowBlocked,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Allowed => "allowed",
            FirewallAction::Audited => "audited",
            FirewallAction::Modified => "modified",
            FirewallAction::Blocked => "blocked",
            FirewallAction::ShadowBlocked => "shadow_blocked",
        }
    }
}

/// Outcome of the firewall pipeline for a single request.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub action: FirewallAction,
    pub reason: Option<String>,
    /// 0..=100.
    pub risk_score: f64,
    pub intent_category: Option<IntentCategory>,
    pub confidence: f64,
    pub latency_ms: f64,
    pub is_shadow_event: bool,
    pub policy_id: Option<String>,
    /// Present when a WAF redact rule rewrote the body; the orchestrator
    /// forwards this copy instead of the original.
    #[serde(skip)]
    pub redacted_body: Option<Value>,
}

impl Decision {
    pub fn allow(risk_score: f64) -> Self {
        Decision {
            allowed: true,
            action: FirewallAction::Allowed,
            reason: None,
            risk_score,
            intent_category: None,
            confidence: 0.0,
            latency_ms: 0.0,
            is_shadow_event: false,
            policy_id: None,
            redacted_body: None,
        }
    }

    pub fn block(reason: impl Into<String>, risk_score: f64) -> Self {
        Decision {
            allowed: false,
            action: FirewallAction::Blocked,
            reason: Some(reason.into()),
            risk_score,
            intent_category: None,
            confidence: 0.0,
            latency_ms: 0.0,
            is_shadow_event: false,
            policy_id: None,
            redacted_body: None,
        }
    }
}

// ── Intent classification ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Destructive,
    DataAccess,
    DataModification,
    ExternalCall,
    CodeExecution,
    FileOperation,
    Unknown,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::Destructive => "destructive",
            IntentCategory::DataAccess => "data_access",
            IntentCategory::DataModification => "data_modification",
            IntentCategory::ExternalCall => "external_call",
            IntentCategory::CodeExecution => "code_execution",
            IntentCategory::FileOperation => "file_operation",
            IntentCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "destructive" => Some(IntentCategory::Destructive),
            "data_access" => Some(IntentCategory::DataAccess),
            "data_modification" => Some(IntentCategory::DataModification),
            "external_call" => Some(IntentCategory::ExternalCall),
            "code_execution" => Some(IntentCategory::CodeExecution),
            "file_operation" => Some(IntentCategory::FileOperation),
            "unknown" => Some(IntentCategory::Unknown),
            _ => None,
        }
    }
}

// ── Organisations & agents ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: Uuid,
    pub name: String,
    pub api_token: String,
    pub settings: Value,
    pub daily_budget: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Revoked,
    Warning,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Revoked => "revoked",
            AgentStatus::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "paused" => Some(AgentStatus::Paused),
            "revoked" => Some(AgentStatus::Revoked),
            "warning" => Some(AgentStatus::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub org_id: Uuid,
    pub name: String,
    pub framework: Option<String>,
    pub status: AgentStatus,
    pub rate_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ── Resource locks & conflicts ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    DatabaseTable,
    File,
    ApiEndpoint,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::DatabaseTable => "database_table",
            ResourceType::File => "file",
            ResourceType::ApiEndpoint => "api_endpoint",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceLock {
    /// First 16 hex chars of SHA-256 over `"type:path"`.
    pub resource_hash: String,
    pub holder_agent_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Granted,
    Queued,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessResult {
    pub resolution: Resolution,
    pub lock: Option<ResourceLock>,
    pub wait_ms: Option<u64>,
    pub reason: Option<String>,
}

// ── Semantic cache ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub cache_id: Uuid,
    pub response_text: String,
    /// 1.0 for an exact hash hit, otherwise cosine similarity.
    pub similarity: f64,
}

// ── Traces ──────────────────────────────────────────────────────

/// One persisted trace row. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    pub duration_ms: f64,
    pub org_id: Uuid,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub agent_framework: Option<String>,
    pub request_type: String,
    pub intent_category: Option<IntentCategory>,
    pub risk_score: f64,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub request_body: Value,
    pub response_body: Value,
    pub reasoning_steps: Vec<String>,
    pub tool_calls: Vec<Value>,
    pub policy_applied: Option<String>,
    pub action_taken: FirewallAction,
    pub block_reason: Option<String>,
    pub is_shadow_event: bool,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub custom_metadata: Value,
}

// ── Anomalies ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: String,
    pub anomaly_type: String,
    pub severity: String,
    pub details: Value,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

// ── Body accessors ──────────────────────────────────────────────
// The upstream payload is schema-less; every field access goes through
// a defensive path.

/// Messages array of an OpenAI-style chat body, if present.
pub fn extract_messages(body: &Value) -> Option<&Vec<Value>> {
    body.get("messages")?.as_array()
}

/// Model name carried in the request body.
pub fn extract_model(body: &Value) -> Option<&str> {
    body.get("model")?.as_str()
}

/// `usage` block of an upstream response: (input_tokens, output_tokens).
/// Understands both OpenAI (`prompt_tokens`/`completion_tokens`) and
/// Anthropic (`input_tokens`/`output_tokens`) shapes.
pub fn extract_usage(body: &Value) -> Option<(i64, i64)> {
    let usage = body.get("usage")?;
    let input = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))?
        .as_i64()?;
    let output = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))?
        .as_i64()?;
    Some((input, output))
}

/// Tool calls from `choices[0].message.tool_calls` of an upstream response.
pub fn extract_tool_calls(body: &Value) -> Vec<Value> {
    body.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("tool_calls"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_usage_openai_shape() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 34}});
        assert_eq!(extract_usage(&body), Some((12, 34)));
    }

    #[test]
    fn test_extract_usage_anthropic_shape() {
        let body = json!({"usage": {"input_tokens": 5, "output_tokens": 7}});
        assert_eq!(extract_usage(&body), Some((5, 7)));
    }

    #[test]
    fn test_extract_usage_missing() {
        assert_eq!(extract_usage(&json!({"choices": []})), None);
        assert_eq!(extract_usage(&json!({"usage": {"prompt_tokens": 1}})), None);
    }

    #[test]
    fn test_extract_tool_calls_defensive() {
        let body = json!({
            "choices": [{"message": {"tool_calls": [{"id": "call_1"}]}}]
        });
        assert_eq!(extract_tool_calls(&body).len(), 1);
        assert!(extract_tool_calls(&json!({})).is_empty());
        assert!(extract_tool_calls(&json!({"choices": "nope"})).is_empty());
    }

    #[test]
    fn test_action_round_trip() {
        let json = serde_json::to_string(&FirewallAction::ShadowBlocked).unwrap();
        assert_eq!(json, "\"shadow_blocked\"");
    }

    #[test]
    fn test_intent_category_parse() {
        assert_eq!(
            IntentCategory::parse("code_execution"),
            Some(IntentCategory::CodeExecution)
        );
        assert_eq!(IntentCategory::parse("nonsense"), None);
    }
}
