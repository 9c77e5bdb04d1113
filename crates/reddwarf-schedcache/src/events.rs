//! Adapter between the cluster event stream and the cache.
//!
//! Delivery is at-least-once, so duplicate adds are absorbed, updates for
//! objects the cache never saw fall back to adds, and deletes for unknown
//! objects are ignored.

use crate::cache::Cache;
use crate::error::{CacheError, Result};
use crate::node_info::PodInfo;
use crate::types::node_name;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A node or pod change as delivered by the event source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// Object kind, `Node` or `Pod`
    pub kind: String,
    /// The serialized object
    pub object: serde_json::Value,
}

impl ClusterEvent {
    /// Create an ADDED event
    pub fn added(kind: impl Into<String>, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Added,
            kind: kind.into(),
            object,
        }
    }

    /// Create a MODIFIED event
    pub fn modified(kind: impl Into<String>, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Modified,
            kind: kind.into(),
            object,
        }
    }

    /// Create a DELETED event
    pub fn deleted(kind: impl Into<String>, object: serde_json::Value) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            kind: kind.into(),
            object,
        }
    }
}

/// Result of applying one event
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// The cache changed (or already held the object)
    Applied,
    /// The event does not concern the cache
    Ignored,
    /// A node was removed; these pods were still bound to it
    Orphaned(Vec<PodInfo>),
}

/// Why [`EventHandler::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cancellation token fired
    Cancelled,
    /// Every sender was dropped
    Closed,
    /// The receiver fell behind and this many events were dropped
    Lagged(u64),
}

/// Feeds node and pod events into a [`Cache`]
pub struct EventHandler {
    cache: Arc<Cache>,
    orphans: Option<mpsc::UnboundedSender<PodInfo>>,
}

impl EventHandler {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            orphans: None,
        }
    }

    /// Forward pods orphaned by node removal to `tx`, e.g. for rescheduling
    pub fn with_orphan_channel(mut self, tx: mpsc::UnboundedSender<PodInfo>) -> Self {
        self.orphans = Some(tx);
        self
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn on_node_add(&self, node: Node) -> Result<()> {
        self.cache.add_node(node)
    }

    pub fn on_node_update(&self, node: Node) -> Result<()> {
        match self.cache.update_node(node.clone()) {
            Err(e) if e.is_not_found() => {
                debug!("Update for unknown node, adding it instead");
                self.cache.add_node(node)
            }
            other => other,
        }
    }

    pub fn on_node_delete(&self, node: &Node) -> Result<Vec<PodInfo>> {
        let name = node_name(node)?;
        let orphans = match self.cache.remove_node(name) {
            Ok(orphans) => orphans,
            Err(e) if e.is_not_found() => {
                debug!("Delete for unknown node {}, ignoring", name);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if let Some(tx) = &self.orphans {
            for pod in &orphans {
                if tx.send(pod.clone()).is_err() {
                    warn!("Orphan channel closed, dropping pod {}", pod.key());
                    break;
                }
            }
        }
        Ok(orphans)
    }

    /// Returns false when the pod does not concern the cache
    pub fn on_pod_add(&self, pod: Pod) -> Result<bool> {
        if !is_assigned(&pod) {
            return Ok(false);
        }
        if is_terminated(&pod) {
            self.remove_terminated(&pod)?;
            return Ok(true);
        }
        self.cache.add_pod(pod)?;
        Ok(true)
    }

    /// Returns false when the pod does not concern the cache
    pub fn on_pod_update(&self, pod: Pod) -> Result<bool> {
        if !is_assigned(&pod) {
            return Ok(false);
        }
        if is_terminated(&pod) {
            self.remove_terminated(&pod)?;
            return Ok(true);
        }

        match self.cache.update_pod(pod.clone()) {
            Err(e) if e.is_not_found() => {
                // unknown or still assumed: the add path confirms it
                self.cache.add_pod(pod)?;
            }
            other => other?,
        }
        Ok(true)
    }

    pub fn on_pod_delete(&self, pod: &Pod) -> Result<()> {
        match self.cache.remove_pod(pod) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Delete for unknown pod, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn remove_terminated(&self, pod: &Pod) -> Result<()> {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        debug!(
            "Pod {} is {}, releasing it",
            pod.metadata.name.as_deref().unwrap_or("<unknown>"),
            phase
        );
        self.on_pod_delete(pod)
    }

    /// Decode and apply a serialized event
    pub fn handle(&self, event: &ClusterEvent) -> Result<EventOutcome> {
        match event.kind.as_str() {
            "Node" => {
                let node: Node = decode(event)?;
                match event.event_type {
                    WatchEventType::Added => self.on_node_add(node)?,
                    WatchEventType::Modified => self.on_node_update(node)?,
                    WatchEventType::Deleted => {
                        let orphans = self.on_node_delete(&node)?;
                        if !orphans.is_empty() {
                            return Ok(EventOutcome::Orphaned(orphans));
                        }
                    }
                }
                Ok(EventOutcome::Applied)
            }
            "Pod" => {
                let pod: Pod = decode(event)?;
                let applied = match event.event_type {
                    WatchEventType::Added => self.on_pod_add(pod)?,
                    WatchEventType::Modified => self.on_pod_update(pod)?,
                    WatchEventType::Deleted => {
                        self.on_pod_delete(&pod)?;
                        true
                    }
                };
                Ok(if applied {
                    EventOutcome::Applied
                } else {
                    EventOutcome::Ignored
                })
            }
            other => {
                debug!("Ignoring {} event", other);
                Ok(EventOutcome::Ignored)
            }
        }
    }

    /// Apply events from `rx` until the channel closes, `token` fires, or
    /// the receiver lags.
    ///
    /// Events skipped by a lag are lost, so on [`RunExit::Lagged`] the
    /// caller must relist nodes and pods (feeding them through the `on_*`
    /// callbacks) before calling `run` again with the same receiver.
    pub async fn run(
        &self,
        rx: &mut broadcast::Receiver<ClusterEvent>,
        token: CancellationToken,
    ) -> RunExit {
        info!("Starting scheduler cache event handler");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler cache event handler shutting down");
                    return RunExit::Cancelled;
                }
                received = rx.recv() => {
                    match received {
                        Ok(event) => {
                            if let Err(e) = self.handle(&event) {
                                error!(
                                    "Failed to apply {:?} {} event: {}",
                                    event.event_type, event.kind, e
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                "Event handler lagged, skipped {} events; cache needs a relist",
                                skipped
                            );
                            return RunExit::Lagged(skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event channel closed, stopping event handler");
                            return RunExit::Closed;
                        }
                    }
                }
            }
        }
    }
}

fn decode<T: DeserializeOwned>(event: &ClusterEvent) -> Result<T> {
    serde_json::from_value(event.object.clone()).map_err(|e| {
        CacheError::serialization(format!("Failed to decode {} object: {}", event.kind, e), Some(e))
    })
}

fn is_assigned(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| !n.is_empty())
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}
