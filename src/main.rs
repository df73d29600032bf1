//! AgentSwitchboard: a reverse proxy between autonomous LLM agents and
//! their model providers, with a semantic firewall, resource locking,
//! a semantic cache, a flight recorder, and a live control plane.

mod anomaly;
mod api;
mod bloom;
mod cache;
mod config;
mod embed;
mod error;
mod events;
mod firewall;
mod intent;
mod kv;
mod patterns;
mod policy;
mod proxy;
mod recorder;
mod state;
mod traffic;
mod tsdb;
mod types;
mod waf;
mod workers;

use crate::cache::SemanticCache;
use crate::config::Config;
use crate::embed::{Embedder, HashEmbedder};
use crate::events::{EventFanout, EventType};
use crate::firewall::SemanticFirewall;
use crate::kv::KvStore;
use crate::policy::{PolicyDocument, PolicyStore};
use crate::recorder::FlightRecorder;
use crate::state::AppState;
use crate::traffic::{EmergencyStop, TrafficController};
use crate::tsdb::TsStore;
use crate::types::Organization;
use crate::waf::{WafRuleSet, WafState};
use crate::workers::WorkerPool;
use anyhow::{Context, Result};
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!(port = config.port, "starting switchboard");

    // ── Stores ──────────────────────────────────────────────────
    let kv = KvStore::connect(&config.redis_url).await?;
    let tsdb = TsStore::connect(&config.timescale_url).await?;
    tsdb.init_schema().await?;
    seed_demo_org(&tsdb, &config).await;

    // ── Collaborators ───────────────────────────────────────────
    // No traffic is accepted until the embedding pipeline reports ready.
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
    embedder.ready().context("embedding pipeline not ready")?;

    // Policy precedence: file, then the last KV-persisted document, then
    // env defaults.
    let initial_policy = match &config.policies_config_path {
        Some(p) => match policy::load_from_file(Path::new(p)) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("policy file unusable, falling back to env defaults: {e:#}");
                PolicyDocument::from_config(&config)
            }
        },
        None => match kv.get("policy:current").await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("persisted policy unusable, falling back to env defaults: {e}");
                PolicyDocument::from_config(&config)
            }),
            _ => PolicyDocument::from_config(&config),
        },
    };
    let policy_store = Arc::new(PolicyStore::new(initial_policy));
    let waf = Arc::new(WafState::new(WafRuleSet::with_defaults()));
    let fanout = Arc::new(EventFanout::new());

    let firewall = Arc::new(SemanticFirewall::new(
        policy_store.clone(),
        waf.clone(),
        config.shadow_mode,
        config.firewall_max_latency_ms,
    ));
    let cache = Arc::new(SemanticCache::new(
        kv.clone(),
        tsdb.clone(),
        embedder.clone(),
        config.cache_ttl_seconds,
        config.cache_similarity_threshold,
    ));
    let traffic = TrafficController::new(
        kv.clone(),
        config.lock_ttl_seconds,
        config.max_queue_depth,
        EmergencyStop::new(config.emergency_stop_enabled),
    );
    let recorder = Arc::new(FlightRecorder::new(tsdb.clone(), kv.clone()));
    let workers = Arc::new(WorkerPool::new());
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .context("building upstream client")?;

    let state = AppState {
        config: config.clone(),
        kv,
        tsdb: tsdb.clone(),
        policy: policy_store.clone(),
        waf,
        firewall,
        cache,
        traffic,
        recorder: recorder.clone(),
        workers,
        fanout: fanout.clone(),
        http,
        paused_all: Arc::new(AtomicBool::new(false)),
    };

    // ── Background tasks ────────────────────────────────────────
    // The watcher handle must stay alive for reloads to fire.
    let _policy_watcher = config.policies_config_path.as_ref().and_then(|path| {
        let fanout = fanout.clone();
        match policy::spawn_watcher(path.clone(), policy_store.clone(), move |doc| {
            fanout.emit(
                EventType::PolicyUpdated,
                None,
                serde_json::to_value(doc.as_ref()).unwrap_or(Value::Null),
            );
        }) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("policy watcher unavailable: {e:#}");
                None
            }
        }
    });
    let flush_task = recorder::spawn_flush_loop(recorder.clone());
    let detector_task = anomaly::spawn_detector(tsdb, fanout);

    // ── Serve ───────────────────────────────────────────────────
    let app = Router::new()
        .nest("/api", api::router())
        .route("/ws", get(events::ws_handler))
        .route("/v1/*path", any(proxy::proxy_handler))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "switchboard listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // One final drain so buffered traces survive an orderly shutdown.
    flush_task.abort();
    detector_task.abort();
    recorder.drain().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Seed the demo organisation so a fresh deployment accepts the demo
/// token. The id is derived from the token, keeping the insert
/// idempotent across restarts.
async fn seed_demo_org(tsdb: &TsStore, config: &Config) {
    let org = Organization {
        org_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, config.demo_org_token.as_bytes()),
        name: "demo".into(),
        api_token: config.demo_org_token.clone(),
        settings: Value::Object(Default::default()),
        daily_budget: 100.0,
        is_active: true,
        created_at: Utc::now(),
    };
    if let Err(e) = tsdb.upsert_org(&org).await {
        warn!("demo org seed failed: {e:#}");
    }
}
