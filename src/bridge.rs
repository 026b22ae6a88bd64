//! Local-Pod Bridge (C7, bridge half): a long-lived WebSocket per
//! online laptop agent, multiplexing `call(pod_id, method, params)`
//! RPCs by correlation id over the one socket, in both directions —
//! the pod also calls back into `lookup_watchers` to recover its
//! subscribers after its own restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::store::WorkspaceStore;
use crate::types::UserId;

/// The only RPC method the pod side ever initiates against the control
/// plane, per §6.4.
const METHOD_LOOKUP_WATCHERS: &str = "lookup_watchers";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Call {
        id: String,
        method: String,
        params: Value,
    },
    Reply {
        id: String,
        result: Option<Value>,
        error: Option<String>,
    },
}

struct PodHandle {
    user_id: UserId,
    outbound: mpsc::UnboundedSender<Message>,
}

#[derive(Clone)]
pub struct Bridge {
    connections: Arc<DashMap<String, PodHandle>>,
    pending: Arc<DashMap<String, oneshot::Sender<Result<Value, String>>>>,
    store: WorkspaceStore,
    metrics: Metrics,
    next_id: Arc<AtomicU64>,
}

impl Bridge {
    pub fn new(store: WorkspaceStore, metrics: Metrics) -> Self {
        Bridge {
            connections: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            store,
            metrics,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_pod_online(&self, pod_id: &str) -> bool {
        self.connections.contains_key(pod_id)
    }

    /// Resolves a workspace's owning pod: a LocalPod id is tied to a
    /// user (§4.7.1), not to a workspace directly, so this picks the
    /// connected pod belonging to `user_id`. `None` if that user has no
    /// pod currently online.
    pub fn pod_for_user(&self, user_id: &str) -> Option<String> {
        self.connections
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
    }

    /// `{id, user_id, status}` for every online laptop agent, per the
    /// Local Pod & Watched Conversation data model — derived entirely
    /// from the live connection map, never stored.
    pub fn connected_pods(&self) -> Vec<crate::types::LocalPod> {
        self.connections
            .iter()
            .map(|entry| crate::types::LocalPod {
                id: entry.key().clone(),
                user_id: entry.value().user_id.clone(),
                online: true,
            })
            .collect()
    }

    /// §4.7.1: a single request/reply over the open channel. Fails fast
    /// with `PodNotConnected` if the channel isn't open, or
    /// `PodTimeout` if no reply arrives within `timeout`.
    pub async fn call(
        &self,
        pod_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        let outbound = {
            let handle = self
                .connections
                .get(pod_id)
                .ok_or_else(|| CoreError::PodNotConnected {
                    pod_id: pod_id.to_string(),
                })?;
            handle.outbound.clone()
        };

        let call_id = format!(
            "core-{}-{}",
            pod_id,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.clone(), tx);

        let frame = Frame::Call {
            id: call_id.clone(),
            method: method.to_string(),
            params,
        };
        let text = serde_json::to_string(&frame).map_err(|e| CoreError::Internal(e.to_string()))?;

        if outbound.send(Message::Text(text)).is_err() {
            self.pending.remove(&call_id);
            return Err(CoreError::PodNotConnected {
                pod_id: pod_id.to_string(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(CoreError::Internal(message)),
            Ok(Err(_canceled)) => Err(CoreError::PodTimeout {
                pod_id: pod_id.to_string(),
            }),
            Err(_elapsed) => {
                // Late reply, if it ever arrives, finds no pending entry
                // and is logged-and-dropped by `handle_incoming`.
                self.pending.remove(&call_id);
                Err(CoreError::PodTimeout {
                    pod_id: pod_id.to_string(),
                })
            }
        }
    }

    /// Drives one accepted WebSocket connection until it closes. Spawns
    /// the outbound pump as a separate task so a slow reader on the pod
    /// side can't stall `call()` callers waiting on other pods.
    pub async fn handle_socket(self, socket: WebSocket, pod_id: String, user_id: UserId) {
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        self.connections.insert(
            pod_id.clone(),
            PodHandle {
                user_id: user_id.clone(),
                outbound: outbound_tx,
            },
        );
        self.metrics.bridge_connected_pods.set(self.connections.len() as i64);
        tracing::info!(pod_id, user_id, "local-pod bridge connection established");

        let pump = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => self.handle_incoming(&pod_id, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.connections.remove(&pod_id);
        self.metrics.bridge_connected_pods.set(self.connections.len() as i64);
        pump.abort();
        tracing::info!(pod_id, "local-pod bridge connection closed");
    }

    async fn handle_incoming(&self, pod_id: &str, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(pod_id, error = %err, "discarding malformed bridge frame");
                return;
            }
        };

        match frame {
            Frame::Reply { id, result, error } => {
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let _ = tx.send(match error {
                        Some(message) => Err(message),
                        None => Ok(result.unwrap_or(Value::Null)),
                    });
                } else {
                    tracing::debug!(pod_id, id, "late bridge reply, no pending caller, dropping");
                }
            }
            Frame::Call { id, method, params } => {
                let reply = if method == METHOD_LOOKUP_WATCHERS {
                    match self.lookup_watchers(&params).await {
                        Ok(value) => Frame::Reply {
                            id,
                            result: Some(value),
                            error: None,
                        },
                        Err(err) => Frame::Reply {
                            id,
                            result: None,
                            error: Some(err.to_string()),
                        },
                    }
                } else {
                    Frame::Reply {
                        id,
                        result: None,
                        error: Some(format!("unknown pod-initiated method '{method}'")),
                    }
                };
                if let Some(handle) = self.connections.get(pod_id) {
                    if let Ok(text) = serde_json::to_string(&reply) {
                        let _ = handle.outbound.send(Message::Text(text));
                    }
                }
            }
        }
    }

    /// §6.4 `lookup_watchers`: answered from the Workspace Store's
    /// mirrored `watched_conversations`, so a laptop bridge restart can
    /// recover subscribers without the core keeping its own index.
    async fn lookup_watchers(&self, params: &Value) -> Result<Value, CoreError> {
        let project_path = params
            .get("project_path")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Internal("lookup_watchers: missing project_path".into()))?;
        let conversation_id = params
            .get("conversation_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Internal("lookup_watchers: missing conversation_id".into()))?;

        let records = self
            .store
            .list_all()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let watchers: Vec<Value> = records
            .iter()
            .flat_map(|r| r.watched_conversations())
            .filter(|w| w.project_path == project_path && w.conversation_id == conversation_id)
            .map(|w| {
                serde_json::json!({
                    "subscriber_session_id": w.subscriber_session_id,
                    "subscriber_agent_id": w.subscriber_agent_id,
                })
            })
            .collect();

        Ok(serde_json::json!({ "watchers": watchers }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_fails_fast_when_pod_not_connected() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        let result = bridge
            .call("nonexistent-pod", "list_projects", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CoreError::PodNotConnected { .. })));
    }

    #[test]
    fn connected_pods_reflects_live_connection_map() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        assert!(bridge.connected_pods().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        bridge.connections.insert(
            "pod-1".into(),
            PodHandle {
                user_id: "u1".into(),
                outbound: tx,
            },
        );
        let pods = bridge.connected_pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].id, "pod-1");
        assert_eq!(pods[0].user_id, "u1");
        assert!(pods[0].online);
    }

    #[test]
    fn pod_for_user_finds_the_connected_pod_owned_by_that_user() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        assert_eq!(bridge.pod_for_user("u1"), None);

        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        bridge.connections.insert(
            "pod-1".into(),
            PodHandle {
                user_id: "u1".into(),
                outbound: tx,
            },
        );
        assert_eq!(bridge.pod_for_user("u1"), Some("pod-1".to_string()));
        assert_eq!(bridge.pod_for_user("u2"), None);
    }

    #[test]
    fn is_pod_online_false_when_never_connected() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        assert!(!bridge.is_pod_online("p1"));
    }

    // A `call()` and the reply that answers it are correlated purely by
    // the generated call id, with no real socket involved: the pod side
    // is simulated by reading the outbound channel and feeding a
    // `Frame::Reply` straight back through `handle_incoming`, the same
    // path a reconnected pod's read loop would use.
    #[tokio::test]
    async fn call_round_trips_through_a_simulated_pod_connection() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        bridge.connections.insert(
            "pod-1".into(),
            PodHandle {
                user_id: "u1".into(),
                outbound: tx,
            },
        );

        let bridge_clone = bridge.clone();
        tokio::spawn(async move {
            if let Some(Message::Text(text)) = rx.recv().await {
                if let Ok(Frame::Call { id, .. }) = serde_json::from_str::<Frame>(&text) {
                    let reply = Frame::Reply {
                        id,
                        result: Some(serde_json::json!({ "ok": true })),
                        error: None,
                    };
                    let reply_text = serde_json::to_string(&reply).unwrap();
                    bridge_clone.handle_incoming("pod-1", &reply_text).await;
                }
            }
        });

        let result = bridge
            .call("pod-1", "list_projects", Value::Null, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({ "ok": true }));
    }

    // Once a pod's connection entry is gone (the bridge side of a
    // reconnect), calls fail fast rather than hanging until timeout —
    // distinguishing "never connected" from "disconnected mid-flight".
    #[tokio::test]
    async fn call_fails_fast_after_pod_disconnects() {
        let bridge = Bridge::new(
            WorkspaceStore::new(redis::Client::open("redis://127.0.0.1/").unwrap()),
            Metrics::default(),
        );
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        bridge.connections.insert(
            "pod-1".into(),
            PodHandle {
                user_id: "u1".into(),
                outbound: tx,
            },
        );
        assert!(bridge.is_pod_online("pod-1"));

        bridge.connections.remove("pod-1");
        let result = bridge
            .call("pod-1", "list_projects", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CoreError::PodNotConnected { .. })));
    }
}
