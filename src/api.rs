//! Control API under `/api`.
//!
//! Read endpoints serve the dashboards; control mutations apply to
//! state/store and always emit a fan-out event.

use crate::error::AppError;
use crate::events::EventType;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;
use uuid::Uuid;

pub fn router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/burn-rate/:org", get(burn_rate))
        .route("/agents/:org", get(agents))
        .route("/traces/:org", get(traces))
        .route("/traces/:org/blocked", get(blocked_traces))
        .route("/traces/:org/shadow", get(shadow_traces))
        .route("/shadow-savings/:org", get(shadow_savings))
        .route("/cache-stats/:org", get(cache_stats))
        .route("/policies/current", get(current_policy))
        .route("/policies", put(update_policy))
        .route("/waf/rules", get(waf_rules))
        .route("/waf/rules/:id", put(toggle_waf_rule))
        .route("/control/pause-all", post(pause_all))
        .route("/control/resume-all", post(resume_all))
        .route("/control/pause-agent", post(pause_agent))
        .route("/control/resume-agent", post(resume_agent))
        .route("/control/revoke-token", post(revoke_token))
        .route("/control/emergency-stop", post(emergency_stop))
        .route("/control/emergency-reset", post(emergency_reset))
        .route("/control/status", get(control_status))
        .route("/anomalies/:id/resolve", post(resolve_anomaly))
        .layer(cors)
}

// ── Read endpoints ──────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pendingTraces": state.recorder.queue_depth(),
    }))
}

async fn burn_rate(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let now = Utc::now();
    let mut history = Vec::with_capacity(60);
    let mut current_rate = 0.0;

    for i in (0..60).rev() {
        let minute = now - Duration::minutes(i);
        let bucket = minute.format("%Y%m%d%H%M").to_string();
        let cost = match state.kv.get(&format!("cost:{org}:{bucket}")).await {
            Ok(v) => v.and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
            Err(e) => {
                warn!("burn-rate bucket read failed: {e:#}");
                0.0
            }
        };
        let requests = state
            .kv
            .get(&format!("req:{org}:{bucket}"))
            .await
            .ok()
            .flatten()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        if i == 0 {
            current_rate = cost;
        }
        history.push(json!({"minute": bucket, "cost": cost, "requests": requests}));
    }

    Ok(Json(json!({
        "currentRate": current_rate,
        "hourlyProjection": current_rate * 60.0,
        "history": history,
    })))
}

async fn agents(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let agents = state.tsdb.agents_for_org(org).await?;
    let count = agents.len();
    Ok(Json(json!({"agents": agents, "count": count})))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn traces(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let traces = state.tsdb.recent_traces(org, limit).await?;
    let count = traces.len();
    Ok(Json(json!({"traces": traces, "count": count})))
}

async fn blocked_traces(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let traces = state.tsdb.blocked_traces(org, limit).await?;
    let count = traces.len();
    Ok(Json(json!({"traces": traces, "count": count})))
}

#[derive(Deserialize)]
struct HoursQuery {
    hours: Option<i64>,
}

async fn shadow_traces(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
    Query(q): Query<HoursQuery>,
) -> Result<Json<Value>, AppError> {
    let hours = q.hours.unwrap_or(24).clamp(1, 24 * 30);
    let traces = state.tsdb.shadow_traces(org, hours).await?;
    let count = traces.len();
    Ok(Json(json!({"traces": traces, "count": count})))
}

async fn shadow_savings(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
    Query(q): Query<HoursQuery>,
) -> Result<Json<Value>, AppError> {
    let hours = q.hours.unwrap_or(24).clamp(1, 24 * 30);
    let (count, mitigated) = state.tsdb.shadow_savings(org, hours).await?;
    Ok(Json(json!({
        "shadowBlockedCount": count,
        "totalMitigatedCost": mitigated,
        "periodHours": hours,
    })))
}

async fn cache_stats(
    State(state): State<AppState>,
    Path(org): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let stats = state.tsdb.cache_stats(org).await?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

// ── Policies & WAF ──────────────────────────────────────────────

async fn current_policy(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.policy.current().as_ref()).unwrap_or(Value::Null))
}

async fn update_policy(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let updated = state
        .policy
        .apply_partial(&patch)
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;

    let doc = serde_json::to_value(updated.as_ref()).map_err(anyhow::Error::from)?;
    if let Err(e) = state
        .tsdb
        .insert_policy_version(&updated.policy_id, updated.version as i64, &doc)
        .await
    {
        warn!("policy version persist failed: {e:#}");
    }
    if let Err(e) = state.kv.set("policy:current", &doc.to_string()).await {
        warn!("policy KV persist failed: {e:#}");
    }
    if let Err(e) = state.kv.publish("switchboard:policy", &doc.to_string()).await {
        warn!("policy publish failed: {e:#}");
    }
    state.fanout.emit(EventType::PolicyUpdated, None, doc.clone());
    Ok(Json(doc))
}

async fn waf_rules(State(state): State<AppState>) -> Json<Value> {
    let rules = state.waf.current().rules();
    Json(json!({"rules": rules}))
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_waf_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Result<Json<Value>, AppError> {
    let rule = state
        .waf
        .toggle(&id, body.enabled)
        .ok_or_else(|| AppError::NotFound(format!("waf rule {id}")))?;
    let payload = serde_json::to_value(&rule).map_err(anyhow::Error::from)?;
    state.fanout.emit(EventType::WafRuleUpdated, None, payload.clone());
    Ok(Json(payload))
}

// ── Control mutations ───────────────────────────────────────────

async fn pause_all(State(state): State<AppState>) -> Json<Value> {
    state.paused_all.store(true, Ordering::SeqCst);
    state
        .fanout
        .emit(EventType::GlobalPauseStatus, None, json!({"paused": true}));
    Json(json!({"paused": true}))
}

async fn resume_all(State(state): State<AppState>) -> Json<Value> {
    state.paused_all.store(false, Ordering::SeqCst);
    state
        .fanout
        .emit(EventType::GlobalPauseStatus, None, json!({"paused": false}));
    Json(json!({"paused": false}))
}

#[derive(Deserialize)]
struct AgentBody {
    #[serde(rename = "agentId")]
    agent_id: String,
}

async fn pause_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentBody>,
) -> Result<Json<Value>, AppError> {
    set_agent_status(&state, &body.agent_id, crate::types::AgentStatus::Paused).await
}

async fn resume_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentBody>,
) -> Result<Json<Value>, AppError> {
    set_agent_status(&state, &body.agent_id, crate::types::AgentStatus::Active).await
}

async fn set_agent_status(
    state: &AppState,
    agent_id: &str,
    status: crate::types::AgentStatus,
) -> Result<Json<Value>, AppError> {
    if !state.tsdb.set_agent_status(agent_id, status).await? {
        return Err(AppError::NotFound(format!("agent {agent_id}")));
    }
    state.fanout.emit(
        EventType::AgentStatus,
        None,
        json!({"agentId": agent_id, "status": status.as_str()}),
    );
    Ok(Json(json!({"agentId": agent_id, "status": status.as_str()})))
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

async fn revoke_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> Result<Json<Value>, AppError> {
    if !state.tsdb.revoke_token(&body.token).await? {
        return Err(AppError::NotFound("token".into()));
    }
    if let Err(e) = state.kv.del(&format!("org:token:{}", body.token)).await {
        warn!("revoked token cache purge failed: {e:#}");
    }
    state.fanout.emit(
        EventType::AgentStatus,
        None,
        json!({"action": "token_revoked"}),
    );
    Ok(Json(json!({"revoked": true})))
}

async fn emergency_stop(State(state): State<AppState>) -> Json<Value> {
    state.traffic.emergency.trigger();
    state
        .fanout
        .emit(EventType::EmergencyStop, None, json!({"engaged": true}));
    Json(json!({"engaged": true}))
}

async fn emergency_reset(State(state): State<AppState>) -> Json<Value> {
    state.traffic.emergency.reset();
    state
        .fanout
        .emit(EventType::EmergencyStop, None, json!({"engaged": false}));
    Json(json!({"engaged": false}))
}

async fn control_status(State(state): State<AppState>) -> Json<Value> {
    let policy = state.policy.current();
    Json(json!({
        "emergencyStop": state.traffic.emergency.is_stopped(),
        "globalPause": state.paused_all.load(Ordering::SeqCst),
        "recorder": state.recorder.stats(),
        "subscribers": state.fanout.subscriber_count(),
        "policy": {"id": policy.policy_id, "version": policy.version},
    }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ResolveBody {
    #[serde(rename = "resolvedBy")]
    resolved_by: Option<String>,
}

async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResolveBody>>,
) -> Result<Json<Value>, AppError> {
    let resolved_by = body
        .and_then(|Json(b)| b.resolved_by)
        .unwrap_or_else(|| "control-api".into());
    if !state.tsdb.resolve_anomaly(id, &resolved_by).await? {
        return Err(AppError::NotFound(format!("anomaly {id}")));
    }
    state.fanout.emit(
        EventType::AnomalyDetected,
        None,
        json!({"anomalyId": id, "status": "resolved", "resolvedBy": resolved_by}),
    );
    Ok(Json(json!({"anomalyId": id, "status": "resolved"})))
}
