use crate::error::{CacheError, Result};
use crate::image_state::{ImageRecord, ImageStateSummary};
use crate::types::{PodKey, Resource, WorkloadState};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;

/// A pod as tracked by the cache, with the derived data the scheduler needs
#[derive(Debug, Clone)]
pub struct PodInfo {
    key: PodKey,
    pod: Arc<Pod>,
    node_name: String,
    requests: Resource,
    has_affinity: bool,
    has_required_anti_affinity: bool,
    topology_spread_keys: Vec<String>,
    state: WorkloadState,
}

impl PodInfo {
    /// Build a record for a pod that is assigned to a node (`spec.nodeName`)
    pub fn new(pod: Pod, state: WorkloadState) -> Result<Self> {
        let key = PodKey::from_pod(&pod)?;
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                CacheError::invalid_object(format!("pod {} has no spec.nodeName", key))
            })?;

        let affinity = pod.spec.as_ref().and_then(|s| s.affinity.as_ref());
        let has_affinity = affinity
            .map(|a| a.pod_affinity.is_some() || a.pod_anti_affinity.is_some())
            .unwrap_or(false);
        let has_required_anti_affinity = affinity
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|anti| anti.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|terms| !terms.is_empty())
            .unwrap_or(false);

        let topology_spread_keys = pod
            .spec
            .as_ref()
            .and_then(|s| s.topology_spread_constraints.as_ref())
            .map(|constraints| {
                constraints
                    .iter()
                    .map(|c| c.topology_key.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            key,
            requests: Resource::pod_requests(&pod),
            pod: Arc::new(pod),
            node_name,
            has_affinity,
            has_required_anti_affinity,
            topology_spread_keys,
            state,
        })
    }

    pub fn key(&self) -> &PodKey {
        &self.key
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    /// Node the pod is bound to
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn requests(&self) -> Resource {
        self.requests
    }

    /// Whether the pod declares pod affinity or anti-affinity
    pub fn has_affinity(&self) -> bool {
        self.has_affinity
    }

    pub fn has_required_anti_affinity(&self) -> bool {
        self.has_required_anti_affinity
    }

    pub fn topology_spread_keys(&self) -> &[String] {
        &self.topology_spread_keys
    }

    pub fn state(&self) -> WorkloadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WorkloadState) {
        self.state = state;
    }
}

/// Aggregated per-node state.
///
/// A record without a node object is a placeholder holding pods whose node
/// has not been reported yet.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    node: Option<Arc<Node>>,
    pods: Vec<PodInfo>,
    requested: Resource,
    allocatable: Resource,
    images: Vec<ImageRecord>,
    image_states: HashMap<String, ImageStateSummary>,
    generation: u64,
}

impl NodeInfo {
    /// Empty placeholder record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a node object, without pods
    pub fn with_node(node: Node) -> Self {
        let mut info = Self::default();
        info.set_node(node);
        info
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_deref()
    }

    /// Node name, if the node object is known
    pub fn name(&self) -> Option<&str> {
        self.node.as_ref().and_then(|n| n.metadata.name.as_deref())
    }

    pub fn pods(&self) -> &[PodInfo] {
        &self.pods
    }

    pub fn pod(&self, key: &PodKey) -> Option<&PodInfo> {
        self.pods.iter().find(|p| p.key() == key)
    }

    pub fn pods_with_affinity(&self) -> impl Iterator<Item = &PodInfo> {
        self.pods.iter().filter(|p| p.has_affinity())
    }

    pub fn pods_with_required_anti_affinity(&self) -> impl Iterator<Item = &PodInfo> {
        self.pods.iter().filter(|p| p.has_required_anti_affinity())
    }

    pub fn has_pods_with_affinity(&self) -> bool {
        self.pods.iter().any(PodInfo::has_affinity)
    }

    pub fn has_pods_with_required_anti_affinity(&self) -> bool {
        self.pods.iter().any(PodInfo::has_required_anti_affinity)
    }

    /// Sum of requests of every pod on the node, assumed ones included
    pub fn requested(&self) -> Resource {
        self.requested
    }

    pub fn allocatable(&self) -> Resource {
        self.allocatable
    }

    /// Allocatable minus requested, clamped at zero
    pub fn free(&self) -> Resource {
        self.allocatable.saturating_sub(&self.requested)
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    /// Image locality summaries; only populated on snapshot copies
    pub fn image_states(&self) -> &HashMap<String, ImageStateSummary> {
        &self.image_states
    }

    /// Cache generation of the last mutation of this record
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_node(&mut self, node: Node) {
        self.allocatable = Resource::node_allocatable(&node);
        self.images = ImageRecord::from_node(&node);
        self.node = Some(Arc::new(node));
    }

    pub(crate) fn add_pod(&mut self, pod: PodInfo) {
        self.requested += pod.requests();
        self.pods.push(pod);
    }

    pub(crate) fn remove_pod(&mut self, key: &PodKey) -> Option<PodInfo> {
        let index = self.pods.iter().position(|p| p.key() == key)?;
        let pod = self.pods.swap_remove(index);
        self.requested -= pod.requests();
        Some(pod)
    }

    pub(crate) fn take_pods(&mut self) -> Vec<PodInfo> {
        self.requested = Resource::default();
        std::mem::take(&mut self.pods)
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub(crate) fn set_image_states(&mut self, states: HashMap<String, ImageStateSummary>) {
        self.image_states = states;
    }
}
