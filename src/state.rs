//! Shared application state wired once at startup.

use crate::cache::SemanticCache;
use crate::config::Config;
use crate::events::EventFanout;
use crate::firewall::SemanticFirewall;
use crate::kv::KvStore;
use crate::policy::PolicyStore;
use crate::recorder::FlightRecorder;
use crate::traffic::TrafficController;
use crate::tsdb::TsStore;
use crate::waf::WafState;
use crate::workers::WorkerPool;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: KvStore,
    pub tsdb: TsStore,
    pub policy: Arc<PolicyStore>,
    pub waf: Arc<WafState>,
    pub firewall: Arc<SemanticFirewall>,
    pub cache: Arc<SemanticCache>,
    pub traffic: TrafficController,
    pub recorder: Arc<FlightRecorder>,
    pub workers: Arc<WorkerPool>,
    pub fanout: Arc<EventFanout>,
    /// One shared client for every upstream forward.
    pub http: reqwest::Client,
    /// Control-plane pause-all switch; checked before any agent lookup.
    pub paused_all: Arc<AtomicBool>,
}
