//! Worker sandbox: registered pre/post hooks with bounded execution.
//!
//! Workers run sorted by `order`, each against a deep copy of the
//! request/response pair, hard-capped at 50 ms. A failing or overrunning
//! worker is skipped; a pre-request worker returning a response
//! short-circuits the pipeline with it.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

const WORKER_TIMEOUT_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTrigger {
    PreRequest,
    PostResponse,
}

/// Deep copy handed to each worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub request: Value,
    pub response: Option<Value>,
    pub env: HashMap<String, String>,
}

/// What a worker may hand back. `None` from the handler means "no
/// changes".
#[derive(Debug, Clone, Default)]
pub struct WorkerOutcome {
    pub modified: bool,
    pub request: Option<Value>,
    pub response: Option<Value>,
}

pub type WorkerHandler =
    Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, anyhow::Result<Option<WorkerOutcome>>> + Send + Sync>;

#[derive(Clone)]
pub struct Worker {
    pub id: String,
    pub trigger: WorkerTrigger,
    pub order: i32,
    pub enabled: bool,
    handler: WorkerHandler,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        trigger: WorkerTrigger,
        order: i32,
        handler: WorkerHandler,
    ) -> Self {
        Self {
            id: id.into(),
            trigger,
            order,
            enabled: true,
            handler,
        }
    }
}

/// Result of running one trigger's chain.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub request: Value,
    pub response: Option<Value>,
    /// Response returned by a pre-request worker; terminates the pipeline.
    pub short_circuit: Option<Value>,
    /// Id of the worker that short-circuited, for the trace metadata.
    pub short_circuit_worker: Option<String>,
}

#[derive(Default)]
pub struct WorkerPool {
    workers: RwLock<Vec<Worker>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker) {
        let mut workers = self.workers.write().expect("worker pool lock poisoned");
        workers.push(worker);
        workers.sort_by_key(|w| w.order);
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut workers = self.workers.write().expect("worker pool lock poisoned");
        let mut found = false;
        for w in workers.iter_mut() {
            if w.id == id {
                w.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// Run all enabled workers of one trigger, threading modifications
    /// through. Worker failures never propagate.
    pub async fn run_chain(
        &self,
        trigger: WorkerTrigger,
        request: Value,
        response: Option<Value>,
        env: HashMap<String, String>,
    ) -> ChainResult {
        let chain: Vec<Worker> = {
            let workers = self.workers.read().expect("worker pool lock poisoned");
            workers
                .iter()
                .filter(|w| w.enabled && w.trigger == trigger)
                .cloned()
                .collect()
        };

        let mut result = ChainResult {
            request,
            response,
            short_circuit: None,
            short_circuit_worker: None,
        };

        for worker in chain {
            let ctx = WorkerContext {
                request: result.request.clone(),
                response: result.response.clone(),
                env: env.clone(),
            };
            let ran = tokio::time::timeout(
                Duration::from_millis(WORKER_TIMEOUT_MS),
                (worker.handler)(ctx),
            )
            .await;

            match ran {
                Ok(Ok(Some(outcome))) => {
                    if outcome.modified {
                        if let Some(req) = outcome.request {
                            result.request = req;
                        }
                        if let Some(resp) = outcome.response.clone() {
                            result.response = Some(resp);
                        }
                    }
                    if trigger == WorkerTrigger::PreRequest {
                        if let Some(resp) = outcome.response {
                            result.short_circuit = Some(resp);
                            result.short_circuit_worker = Some(worker.id.clone());
                            break;
                        }
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(worker = %worker.id, "worker failed, skipping: {e:#}"),
                Err(_) => warn!(worker = %worker.id, "worker exceeded {WORKER_TIMEOUT_MS}ms, skipping"),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn tagging_worker(id: &str, order: i32, tag: &'static str) -> Worker {
        Worker::new(
            id,
            WorkerTrigger::PreRequest,
            order,
            Arc::new(move |ctx: WorkerContext| {
                async move {
                    let mut req = ctx.request;
                    let mut tags = req
                        .get("tags")
                        .and_then(|t| t.as_array())
                        .cloned()
                        .unwrap_or_default();
                    tags.push(json!(tag));
                    req["tags"] = json!(tags);
                    Ok(Some(WorkerOutcome {
                        modified: true,
                        request: Some(req),
                        response: None,
                    }))
                }
                .boxed()
            }),
        )
    }

    #[tokio::test]
    async fn test_workers_run_in_order() {
        let pool = WorkerPool::new();
        pool.register(tagging_worker("second", 20, "b"));
        pool.register(tagging_worker("first", 10, "a"));

        let out = pool
            .run_chain(WorkerTrigger::PreRequest, json!({}), None, HashMap::new())
            .await;
        assert_eq!(out.request["tags"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_failing_worker_is_skipped() {
        let pool = WorkerPool::new();
        pool.register(Worker::new(
            "boom",
            WorkerTrigger::PreRequest,
            1,
            Arc::new(|_| async { anyhow::bail!("worker exploded") }.boxed()),
        ));
        pool.register(tagging_worker("after", 2, "ok"));

        let out = pool
            .run_chain(WorkerTrigger::PreRequest, json!({}), None, HashMap::new())
            .await;
        assert_eq!(out.request["tags"], json!(["ok"]));
    }

    #[tokio::test]
    async fn test_slow_worker_times_out() {
        let pool = WorkerPool::new();
        pool.register(Worker::new(
            "slow",
            WorkerTrigger::PreRequest,
            1,
            Arc::new(|ctx: WorkerContext| {
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let mut req = ctx.request;
                    req["late"] = json!(true);
                    Ok(Some(WorkerOutcome {
                        modified: true,
                        request: Some(req),
                        response: None,
                    }))
                }
                .boxed()
            }),
        ));

        let out = pool
            .run_chain(WorkerTrigger::PreRequest, json!({}), None, HashMap::new())
            .await;
        assert!(out.request.get("late").is_none());
    }

    #[tokio::test]
    async fn test_pre_worker_short_circuits() {
        let pool = WorkerPool::new();
        pool.register(Worker::new(
            "canned",
            WorkerTrigger::PreRequest,
            1,
            Arc::new(|_| {
                async {
                    Ok(Some(WorkerOutcome {
                        modified: false,
                        request: None,
                        response: Some(json!({"canned": true})),
                    }))
                }
                .boxed()
            }),
        ));
        pool.register(tagging_worker("never", 2, "unreachable"));

        let out = pool
            .run_chain(WorkerTrigger::PreRequest, json!({}), None, HashMap::new())
            .await;
        assert_eq!(out.short_circuit, Some(json!({"canned": true})));
        assert_eq!(out.short_circuit_worker.as_deref(), Some("canned"));
        assert!(out.request.get("tags").is_none());
    }

    #[tokio::test]
    async fn test_disabled_worker_is_skipped() {
        let pool = WorkerPool::new();
        pool.register(tagging_worker("off", 1, "nope"));
        assert!(pool.set_enabled("off", false));

        let out = pool
            .run_chain(WorkerTrigger::PreRequest, json!({}), None, HashMap::new())
            .await;
        assert!(out.request.get("tags").is_none());
        assert!(!pool.set_enabled("missing", false));
    }

    #[tokio::test]
    async fn test_post_response_worker_modifies_response() {
        let pool = WorkerPool::new();
        pool.register(Worker::new(
            "annotate",
            WorkerTrigger::PostResponse,
            1,
            Arc::new(|ctx: WorkerContext| {
                async move {
                    let mut resp = ctx.response.unwrap_or(json!({}));
                    resp["annotated"] = json!(true);
                    Ok(Some(WorkerOutcome {
                        modified: true,
                        request: None,
                        response: Some(resp),
                    }))
                }
                .boxed()
            }),
        ));

        let out = pool
            .run_chain(
                WorkerTrigger::PostResponse,
                json!({}),
                Some(json!({"answer": 4})),
                HashMap::new(),
            )
            .await;
        let resp = out.response.unwrap();
        assert_eq!(resp["answer"], json!(4));
        assert_eq!(resp["annotated"], json!(true));
        assert!(out.short_circuit.is_none());
    }
}
