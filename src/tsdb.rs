//! Time-series store adapter (TimescaleDB over sqlx).
//!
//! Owns the bounded connection pool and every SQL statement in the
//! system. Traces land in the `agent_traces` hypertable; the semantic
//! cache rows carry a pgvector column queried with the cosine operator.

use crate::types::{
    Agent, AgentStatus, Anomaly, FirewallAction, IntentCategory, Organization, Trace,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct TsStore {
    pool: PgPool,
}

/// Per-agent token baseline over the lookback window.
#[derive(Debug, Clone)]
pub struct AgentBaseline {
    pub org_id: Uuid,
    pub agent_id: String,
    pub mean_tokens: f64,
    pub stddev_tokens: f64,
    pub trace_count: i64,
}

/// Minimal trace projection for the anomaly scan.
#[derive(Debug, Clone)]
pub struct TraceTokens {
    pub trace_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: String,
    pub total_tokens: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub total_hits: i64,
    pub total_cost_saved: f64,
}

impl TsStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .context("connecting to timescale")?;
        Ok(Self { pool })
    }

    /// Create the persisted layout. Plain tables are required; the
    /// Timescale/pgvector statements are best-effort so a pre-provisioned
    /// or vanilla-Postgres database still comes up (ANN lookups then fail
    /// open at runtime).
    pub async fn init_schema(&self) -> Result<()> {
        for stmt in REQUIRED_SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", &stmt[..stmt.len().min(60)]))?;
        }
        for stmt in OPTIONAL_SCHEMA {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                warn!("optional schema statement skipped: {e}");
            }
        }
        Ok(())
    }

    // ── Organisations ───────────────────────────────────────────

    pub async fn upsert_org(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (org_id, name, api_token, settings, daily_budget, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id) DO NOTHING
            "#,
        )
        .bind(org.org_id)
        .bind(&org.name)
        .bind(&org.api_token)
        .bind(&org.settings)
        .bind(org.daily_budget)
        .bind(org.is_active)
        .bind(org.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn org_by_token(&self, token: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            r#"
            SELECT org_id, name, api_token, settings, daily_budget, is_active, created_at
            FROM organizations
            WHERE api_token = $1 AND is_active
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Organization {
                org_id: r.try_get("org_id")?,
                name: r.try_get("name")?,
                api_token: r.try_get("api_token")?,
                settings: r.try_get("settings")?,
                daily_budget: r.try_get("daily_budget")?,
                is_active: r.try_get("is_active")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn revoke_token(&self, token: &str) -> Result<bool> {
        let done = sqlx::query("UPDATE organizations SET is_active = FALSE WHERE api_token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ── Agents ──────────────────────────────────────────────────

    /// Auto-create on first observed request; later sightings refresh
    /// name/framework but never touch status.
    pub async fn upsert_agent(
        &self,
        agent_id: &str,
        org_id: Uuid,
        name: &str,
        framework: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, org_id, name, framework, status, created_at)
            VALUES ($1, $2, $3, $4, 'active', now())
            ON CONFLICT (agent_id) DO UPDATE
            SET name = EXCLUDED.name,
                framework = COALESCE(EXCLUDED.framework, agents.framework)
            "#,
        )
        .bind(agent_id)
        .bind(org_id)
        .bind(name)
        .bind(framework)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentStatus>> {
        let row = sqlx::query("SELECT status FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<String, _>("status"))
            .transpose()?
            .and_then(|s| AgentStatus::parse(&s)))
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool> {
        let done = sqlx::query("UPDATE agents SET status = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn agents_for_org(&self, org_id: Uuid) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, org_id, name, framework, status, rate_limit, created_at
            FROM agents WHERE org_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let status: String = r.try_get("status")?;
                Ok(Agent {
                    agent_id: r.try_get("agent_id")?,
                    org_id: r.try_get("org_id")?,
                    name: r.try_get("name")?,
                    framework: r.try_get("framework")?,
                    status: AgentStatus::parse(&status).unwrap_or(AgentStatus::Active),
                    rate_limit: r.try_get("rate_limit")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    // ── Traces ──────────────────────────────────────────────────

    pub async fn insert_trace(&self, trace: &Trace) -> Result<()> {
        bind_trace(sqlx::query(INSERT_TRACE_SQL), trace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One transaction per batch; the caller bounds the batch size.
    pub async fn insert_traces(&self, traces: &[Trace]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for trace in traces {
            bind_trace(sqlx::query(INSERT_TRACE_SQL), trace)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn recent_traces(&self, org_id: Uuid, limit: i64) -> Result<Vec<Trace>> {
        let rows = sqlx::query(&format!("{TRACE_SELECT} WHERE org_id = $1 ORDER BY ts DESC LIMIT $2"))
            .bind(org_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trace_from_row).collect()
    }

    pub async fn blocked_traces(&self, org_id: Uuid, limit: i64) -> Result<Vec<Trace>> {
        let rows = sqlx::query(&format!(
            "{TRACE_SELECT} WHERE org_id = $1 AND action_taken = 'blocked' ORDER BY ts DESC LIMIT $2"
        ))
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trace_from_row).collect()
    }

    pub async fn shadow_traces(&self, org_id: Uuid, hours: i64) -> Result<Vec<Trace>> {
        let rows = sqlx::query(&format!(
            "{TRACE_SELECT} WHERE org_id = $1 AND is_shadow_event AND ts > now() - make_interval(hours => $2::int) ORDER BY ts DESC"
        ))
        .bind(org_id)
        .bind(hours)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trace_from_row).collect()
    }

    /// (shadow-blocked count, total mitigated cost) over the window.
    pub async fn shadow_savings(&self, org_id: Uuid, hours: i64) -> Result<(i64, f64)> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS n, COALESCE(sum(cost_usd), 0.0) AS mitigated
            FROM agent_traces
            WHERE org_id = $1 AND is_shadow_event
              AND ts > now() - make_interval(hours => $2::int)
            "#,
        )
        .bind(org_id)
        .bind(hours)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("n")?, row.try_get("mitigated")?))
    }

    // ── Anomaly scan projections ────────────────────────────────

    pub async fn agent_baselines(&self, min_traces: i64) -> Result<Vec<AgentBaseline>> {
        let rows = sqlx::query(
            r#"
            SELECT org_id, agent_id,
                   avg(COALESCE(input_tokens, 0) + COALESCE(output_tokens, 0))::float8 AS mean_tokens,
                   COALESCE(stddev_samp(COALESCE(input_tokens, 0) + COALESCE(output_tokens, 0)), 0.0)::float8 AS stddev_tokens,
                   count(*) AS trace_count
            FROM agent_traces
            WHERE ts > now() - INTERVAL '24 hours'
            GROUP BY org_id, agent_id
            HAVING count(*) >= $1
            "#,
        )
        .bind(min_traces)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(AgentBaseline {
                    org_id: r.try_get("org_id")?,
                    agent_id: r.try_get("agent_id")?,
                    mean_tokens: r.try_get("mean_tokens")?,
                    stddev_tokens: r.try_get("stddev_tokens")?,
                    trace_count: r.try_get("trace_count")?,
                })
            })
            .collect()
    }

    pub async fn recent_token_counts(&self, minutes: i64) -> Result<Vec<TraceTokens>> {
        let rows = sqlx::query(
            r#"
            SELECT trace_id, org_id, agent_id, ts,
                   (COALESCE(input_tokens, 0) + COALESCE(output_tokens, 0)) AS total_tokens
            FROM agent_traces
            WHERE ts > now() - make_interval(mins => $1::int)
            "#,
        )
        .bind(minutes)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(TraceTokens {
                    trace_id: r.try_get("trace_id")?,
                    org_id: r.try_get("org_id")?,
                    agent_id: r.try_get("agent_id")?,
                    total_tokens: r.try_get("total_tokens")?,
                    ts: r.try_get("ts")?,
                })
            })
            .collect()
    }

    // ── Anomalies ───────────────────────────────────────────────

    pub async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anomalies
              (anomaly_id, org_id, agent_id, anomaly_type, severity, details, detected_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
            "#,
        )
        .bind(anomaly.anomaly_id)
        .bind(anomaly.org_id)
        .bind(&anomaly.agent_id)
        .bind(&anomaly.anomaly_type)
        .bind(&anomaly.severity)
        .bind(&anomaly.details)
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve_anomaly(&self, anomaly_id: Uuid, resolved_by: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE anomalies
            SET status = 'resolved', resolved_at = now(), resolved_by = $2
            WHERE anomaly_id = $1 AND status = 'active'
            "#,
        )
        .bind(anomaly_id)
        .bind(resolved_by)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    // ── Policies ────────────────────────────────────────────────

    pub async fn insert_policy_version(
        &self,
        policy_id: &str,
        version: i64,
        document: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO policies (policy_id, version, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (policy_id, version) DO UPDATE SET document = EXCLUDED.document
            "#,
        )
        .bind(policy_id)
        .bind(version)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Semantic cache ──────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn cache_insert(
        &self,
        cache_id: Uuid,
        org_id: Uuid,
        model: &str,
        prompt_hash: &str,
        embedding: &[f32],
        prompt_text: &str,
        response_text: &str,
        response_tokens: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO semantic_cache
              (cache_id, org_id, model, prompt_hash, prompt_embedding,
               prompt_text, response_text, response_tokens, expires_at)
            VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9)
            ON CONFLICT (org_id, model, prompt_hash) DO UPDATE
            SET prompt_embedding = EXCLUDED.prompt_embedding,
                prompt_text = EXCLUDED.prompt_text,
                response_text = EXCLUDED.response_text,
                response_tokens = EXCLUDED.response_tokens,
                expires_at = EXCLUDED.expires_at,
                created_at = now(),
                hit_count = 0,
                cost_saved = 0
            "#,
        )
        .bind(cache_id)
        .bind(org_id)
        .bind(model)
        .bind(prompt_hash)
        .bind(vector_literal(embedding))
        .bind(prompt_text)
        .bind(response_text)
        .bind(response_tokens)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Nearest non-expired entry for `(org, model)` by cosine distance,
    /// when under `max_distance`.
    pub async fn cache_ann_lookup(
        &self,
        org_id: Uuid,
        model: &str,
        embedding: &[f32],
        max_distance: f64,
    ) -> Result<Option<(Uuid, String, f64)>> {
        let row = sqlx::query(
            r#"
            SELECT cache_id, response_text,
                   (prompt_embedding <=> $3::vector)::float8 AS distance
            FROM semantic_cache
            WHERE org_id = $1 AND model = $2 AND expires_at > now()
            ORDER BY prompt_embedding <=> $3::vector
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(model)
        .bind(vector_literal(embedding))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let distance: f64 = r.try_get("distance")?;
                if distance < max_distance {
                    Ok(Some((r.try_get("cache_id")?, r.try_get("response_text")?, distance)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub async fn cache_record_hit(&self, cache_id: Uuid, cost_saved: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE semantic_cache
            SET hit_count = hit_count + 1, cost_saved = cost_saved + $2
            WHERE cache_id = $1
            "#,
        )
        .bind(cache_id)
        .bind(cost_saved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_stats(&self, org_id: Uuid) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS entries,
                   COALESCE(sum(hit_count), 0)::int8 AS total_hits,
                   COALESCE(sum(cost_saved), 0.0) AS total_cost_saved
            FROM semantic_cache
            WHERE org_id = $1 AND expires_at > now()
            "#,
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            entries: row.try_get("entries")?,
            total_hits: row.try_get("total_hits")?,
            total_cost_saved: row.try_get("total_cost_saved")?,
        })
    }
}

// ── SQL & row mapping ───────────────────────────────────────────

const INSERT_TRACE_SQL: &str = r#"
INSERT INTO agent_traces
  (trace_id, span_id, parent_span_id, ts, duration_ms, org_id, agent_id,
   agent_name, agent_framework, request_type, intent_category, risk_score,
   model_provider, model_name, input_tokens, output_tokens, cost_usd,
   request_body, response_body, reasoning_steps, tool_calls, policy_applied,
   action_taken, block_reason, is_shadow_event, client_ip, user_agent,
   custom_metadata)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
        $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
"#;

const TRACE_SELECT: &str = r#"
SELECT trace_id, span_id, parent_span_id, ts, duration_ms, org_id, agent_id,
       agent_name, agent_framework, request_type, intent_category, risk_score,
       model_provider, model_name, input_tokens, output_tokens, cost_usd,
       request_body, response_body, reasoning_steps, tool_calls, policy_applied,
       action_taken, block_reason, is_shadow_event, client_ip, user_agent,
       custom_metadata
FROM agent_traces
"#;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_trace<'q>(query: PgQuery<'q>, trace: &'q Trace) -> PgQuery<'q> {
    query
        .bind(trace.trace_id)
        .bind(trace.span_id)
        .bind(trace.parent_span_id)
        .bind(trace.ts)
        .bind(trace.duration_ms)
        .bind(trace.org_id)
        .bind(&trace.agent_id)
        .bind(&trace.agent_name)
        .bind(&trace.agent_framework)
        .bind(&trace.request_type)
        .bind(trace.intent_category.map(|c| c.as_str()))
        .bind(trace.risk_score)
        .bind(&trace.model_provider)
        .bind(&trace.model_name)
        .bind(trace.input_tokens)
        .bind(trace.output_tokens)
        .bind(trace.cost_usd)
        .bind(&trace.request_body)
        .bind(&trace.response_body)
        .bind(Value::from(trace.reasoning_steps.clone()))
        .bind(Value::from(trace.tool_calls.clone()))
        .bind(&trace.policy_applied)
        .bind(trace.action_taken.as_str())
        .bind(&trace.block_reason)
        .bind(trace.is_shadow_event)
        .bind(&trace.client_ip)
        .bind(&trace.user_agent)
        .bind(&trace.custom_metadata)
}

fn trace_from_row(row: &PgRow) -> Result<Trace> {
    let intent: Option<String> = row.try_get("intent_category")?;
    let action: String = row.try_get("action_taken")?;
    let reasoning: Value = row.try_get("reasoning_steps")?;
    let tool_calls: Value = row.try_get("tool_calls")?;

    Ok(Trace {
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        ts: row.try_get("ts")?,
        duration_ms: row.try_get("duration_ms")?,
        org_id: row.try_get("org_id")?,
        agent_id: row.try_get("agent_id")?,
        agent_name: row.try_get("agent_name")?,
        agent_framework: row.try_get("agent_framework")?,
        request_type: row.try_get("request_type")?,
        intent_category: intent.as_deref().and_then(IntentCategory::parse),
        risk_score: row.try_get("risk_score")?,
        model_provider: row.try_get("model_provider")?,
        model_name: row.try_get("model_name")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        cost_usd: row.try_get("cost_usd")?,
        request_body: row.try_get("request_body")?,
        response_body: row.try_get("response_body")?,
        reasoning_steps: reasoning
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        tool_calls: tool_calls.as_array().cloned().unwrap_or_default(),
        policy_applied: row.try_get("policy_applied")?,
        action_taken: parse_action(&action),
        block_reason: row.try_get("block_reason")?,
        is_shadow_event: row.try_get("is_shadow_event")?,
        client_ip: row.try_get("client_ip")?,
        user_agent: row.try_get("user_agent")?,
        custom_metadata: row.try_get("custom_metadata")?,
    })
}

fn parse_action(s: &str) -> FirewallAction {
    match s {
        "audited" => FirewallAction::Audited,
        "modified" => FirewallAction::Modified,
        "blocked" => FirewallAction::Blocked,
        "shadow_blocked" => FirewallAction::ShadowBlocked,
        _ => FirewallAction::Allowed,
    }
}

/// pgvector text literal: `[0.1,0.2,...]`.
fn vector_literal(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

const REQUIRED_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        org_id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        api_token TEXT NOT NULL UNIQUE,
        settings JSONB NOT NULL DEFAULT '{}',
        daily_budget DOUBLE PRECISION NOT NULL DEFAULT 100,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        org_id UUID NOT NULL,
        name TEXT NOT NULL,
        framework TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        rate_limit BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS policies (
        policy_id TEXT NOT NULL,
        version BIGINT NOT NULL,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (policy_id, version)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS anomalies (
        anomaly_id UUID PRIMARY KEY,
        org_id UUID NOT NULL,
        agent_id TEXT NOT NULL,
        anomaly_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        details JSONB NOT NULL DEFAULT '{}',
        detected_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        status TEXT NOT NULL DEFAULT 'active',
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_traces (
        trace_id UUID NOT NULL,
        span_id UUID NOT NULL,
        parent_span_id UUID,
        ts TIMESTAMPTZ NOT NULL,
        duration_ms DOUBLE PRECISION NOT NULL,
        org_id UUID NOT NULL,
        agent_id TEXT NOT NULL,
        agent_name TEXT,
        agent_framework TEXT,
        request_type TEXT NOT NULL,
        intent_category TEXT,
        risk_score DOUBLE PRECISION NOT NULL,
        model_provider TEXT,
        model_name TEXT,
        input_tokens BIGINT,
        output_tokens BIGINT,
        cost_usd DOUBLE PRECISION,
        request_body JSONB,
        response_body JSONB,
        reasoning_steps JSONB NOT NULL DEFAULT '[]',
        tool_calls JSONB NOT NULL DEFAULT '[]',
        policy_applied TEXT,
        action_taken TEXT NOT NULL,
        block_reason TEXT,
        is_shadow_event BOOLEAN NOT NULL DEFAULT FALSE,
        client_ip TEXT NOT NULL,
        user_agent TEXT,
        custom_metadata JSONB NOT NULL DEFAULT '{}'
    )"#,
    "CREATE INDEX IF NOT EXISTS agent_traces_org_ts_idx ON agent_traces (org_id, ts DESC)",
];

const OPTIONAL_SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS timescaledb",
    "CREATE EXTENSION IF NOT EXISTS vector",
    "SELECT create_hypertable('agent_traces', 'ts', chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE, migrate_data => TRUE)",
    "ALTER TABLE agent_traces SET (timescaledb.compress, timescaledb.compress_segmentby = 'org_id')",
    "SELECT add_compression_policy('agent_traces', INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT add_retention_policy('agent_traces', INTERVAL '90 days', if_not_exists => TRUE)",
    r#"
    CREATE TABLE IF NOT EXISTS semantic_cache (
        cache_id UUID PRIMARY KEY,
        org_id UUID NOT NULL,
        model TEXT NOT NULL,
        prompt_hash TEXT NOT NULL,
        prompt_embedding vector(384),
        prompt_text TEXT NOT NULL,
        response_text TEXT NOT NULL,
        response_tokens BIGINT,
        hit_count BIGINT NOT NULL DEFAULT 0,
        cost_saved DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        UNIQUE (org_id, model, prompt_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS semantic_cache_ann_idx ON semantic_cache USING ivfflat (prompt_embedding vector_cosine_ops)",
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS hourly_costs
    WITH (timescaledb.continuous) AS
    SELECT org_id, time_bucket('1 hour', ts) AS bucket,
           sum(cost_usd) AS cost, count(*) AS requests
    FROM agent_traces GROUP BY org_id, bucket
    WITH NO DATA"#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS hourly_shadow_savings
    WITH (timescaledb.continuous) AS
    SELECT org_id, time_bucket('1 hour', ts) AS bucket,
           count(*) AS shadow_blocked, sum(cost_usd) AS mitigated_cost
    FROM agent_traces WHERE is_shadow_event GROUP BY org_id, bucket
    WITH NO DATA"#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS cache_stats_hourly
    WITH (timescaledb.continuous) AS
    SELECT org_id, time_bucket('1 hour', ts) AS bucket, count(*) AS requests
    FROM agent_traces GROUP BY org_id, bucket
    WITH NO DATA"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_shape() {
        assert_eq!(vector_literal(&[0.5, -1.0, 0.0]), "[0.5,-1,0]");
    }

    #[test]
    fn test_parse_action_fallback() {
        assert_eq!(parse_action("blocked"), FirewallAction::Blocked);
        assert_eq!(parse_action("unexpected"), FirewallAction::Allowed);
    }
}
