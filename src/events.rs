//! Event fan-out and the `/ws` push channel.
//!
//! Subscribers register an org filter and an interest set; broadcasts are
//! best-effort and closed subscribers are dropped on the next emit.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keep-alive ping cadence; tuned below typical L7 proxy idle timeouts.
const KEEPALIVE_SECS: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    BurnRate,
    AnomalyDetected,
    TraceEvent,
    GlobalPauseStatus,
    AgentBlocked,
    PolicyUpdated,
    WafRuleUpdated,
    EmergencyStop,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub payload: Value,
    /// ISO-8601.
    pub timestamp: String,
    #[serde(skip)]
    org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// `None` subscribes to every organisation.
    pub org_id: Option<Uuid>,
    /// `None` subscribes to every event type.
    pub interests: Option<HashSet<EventType>>,
}

struct Subscriber {
    filter: Subscription,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
pub struct EventFanout {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: Subscription) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .expect("fanout lock poisoned")
            .insert(id, Subscriber { filter, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers
            .lock()
            .expect("fanout lock poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("fanout lock poisoned").len()
    }

    /// Broadcast to every matching subscriber; drop the closed ones.
    pub fn emit(&self, kind: EventType, org_id: Option<Uuid>, payload: Value) {
        let event = Event {
            kind,
            payload,
            timestamp: Utc::now().to_rfc3339(),
            org_id,
        };

        let mut dead: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("fanout lock poisoned");
            for (id, sub) in subscribers.iter() {
                if !matches(&sub.filter, &event) {
                    continue;
                }
                if sub.tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("fanout lock poisoned");
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

fn matches(filter: &Subscription, event: &Event) -> bool {
    // Global events (no org) reach everyone; org-scoped events reach
    // unfiltered subscribers and matching org filters.
    let org_ok = match (filter.org_id, event.org_id) {
        (Some(want), Some(have)) => want == have,
        _ => true,
    };
    let kind_ok = filter
        .interests
        .as_ref()
        .map(|set| set.contains(&event.kind))
        .unwrap_or(true);
    org_ok && kind_ok
}

// ── /ws channel ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    action: String,
    #[serde(rename = "orgId")]
    org_id: Option<Uuid>,
    events: Option<Vec<EventType>>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // The first client message picks the filter; anything else before a
    // valid subscribe is ignored.
    let filter = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(raw))) => {
                match serde_json::from_str::<SubscribeMessage>(&raw) {
                    Ok(msg) if msg.action == "subscribe" => {
                        break Subscription {
                            org_id: msg.org_id,
                            interests: msg.events.map(|e| e.into_iter().collect()),
                        };
                    }
                    _ => debug!("ignoring non-subscribe message before subscription"),
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("event channel error before subscribe: {e}");
                return;
            }
        }
    };

    let (sub_id, mut rx) = state.fanout.subscribe(filter);
    info!(%sub_id, "event channel subscriber attached");

    let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%sub_id, "event channel read error: {e}");
                        break;
                    }
                    // Re-subscription and pongs are ignored mid-stream.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.fanout.unsubscribe(sub_id);
    info!(%sub_id, "event channel subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_reaches_matching_subscriber() {
        let fanout = EventFanout::new();
        let (_, mut rx) = fanout.subscribe(Subscription::default());
        fanout.emit(EventType::AgentBlocked, None, json!({"agent": "a1"}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventType::AgentBlocked);
        assert_eq!(event.payload["agent"], json!("a1"));
    }

    #[test]
    fn test_org_filter_excludes_other_orgs() {
        let fanout = EventFanout::new();
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();
        let (_, mut rx) = fanout.subscribe(Subscription {
            org_id: Some(mine),
            interests: None,
        });

        fanout.emit(EventType::TraceEvent, Some(theirs), json!({}));
        assert!(rx.try_recv().is_err());

        fanout.emit(EventType::TraceEvent, Some(mine), json!({}));
        assert!(rx.try_recv().is_ok());

        // Global events reach org-filtered subscribers too.
        fanout.emit(EventType::EmergencyStop, None, json!({}));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_interest_filter() {
        let fanout = EventFanout::new();
        let (_, mut rx) = fanout.subscribe(Subscription {
            org_id: None,
            interests: Some([EventType::AnomalyDetected].into_iter().collect()),
        });

        fanout.emit(EventType::TraceEvent, None, json!({}));
        assert!(rx.try_recv().is_err());
        fanout.emit(EventType::AnomalyDetected, None, json!({}));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let fanout = EventFanout::new();
        let (_, rx) = fanout.subscribe(Subscription::default());
        assert_eq!(fanout.subscriber_count(), 1);
        drop(rx);
        fanout.emit(EventType::TraceEvent, None, json!({}));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = Event {
            kind: EventType::PolicyUpdated,
            payload: json!({"version": 2}),
            timestamp: "2026-01-01T00:00:00Z".into(),
            org_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("policy_updated"));
        assert!(value.get("org_id").is_none());
    }
}
