use crate::assumed::AssumedPods;
use crate::error::{CacheError, Result};
use crate::image_state::{image_names, layer_digests, ExistenceIndex};
use crate::node_info::{NodeInfo, PodInfo};
use crate::node_tree::NodeTree;
use crate::types::{node_name, PodKey, WorkloadState};
use k8s_openapi::api::core::v1::{Node, Pod};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the scheduler cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an assumed pod may wait for confirmation; zero disables expiry
    pub assumed_pod_ttl: Duration,
    /// Interval between expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            assumed_pod_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time copy of the cache contents, for debugging
#[derive(Debug, Clone)]
pub struct CacheDump {
    pub nodes: HashMap<String, NodeInfo>,
    pub assumed_pods: Vec<PodKey>,
}

/// Everything behind the cache lock
#[derive(Debug)]
pub(crate) struct CacheState {
    /// Node name -> record; records without a node object are placeholders
    pub(crate) nodes: HashMap<String, NodeInfo>,
    /// Generation -> node name, one entry per record
    pub(crate) generations: BTreeMap<u64, String>,
    /// Pod -> node it is bound to, assumed or confirmed
    pub(crate) pod_nodes: HashMap<PodKey, String>,
    pub(crate) assumed: AssumedPods,
    pub(crate) node_tree: NodeTree,
    pub(crate) images: ExistenceIndex,
    pub(crate) layers: ExistenceIndex,
    /// Last generation handed out
    pub(crate) generation: u64,
}

impl CacheState {
    fn new(assumed_pod_ttl: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            generations: BTreeMap::new(),
            pod_nodes: HashMap::new(),
            assumed: AssumedPods::new(assumed_pod_ttl),
            node_tree: NodeTree::new(),
            images: ExistenceIndex::default(),
            layers: ExistenceIndex::default(),
            generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Mark a record as changed
    fn touch(&mut self, node_name: &str) {
        let generation = self.next_generation();
        if let Some(info) = self.nodes.get_mut(node_name) {
            self.generations.remove(&info.generation());
            info.set_generation(generation);
            self.generations.insert(generation, node_name.to_string());
        }
    }

    pub(crate) fn has_node(&self, node_name: &str) -> bool {
        self.nodes
            .get(node_name)
            .is_some_and(|info| info.node().is_some())
    }

    fn set_node(&mut self, name: &str, node: Node) -> Result<()> {
        if self
            .nodes
            .get(name)
            .and_then(NodeInfo::node)
            .is_some_and(|current| *current == node)
        {
            debug!("Node {} unchanged, skipping", name);
            return Ok(());
        }

        self.node_tree.add_node(&node)?;

        let info = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(NodeInfo::new);
        let old_images = image_names(info.images());
        let old_layers = layer_digests(info.images());
        info.set_node(node);
        let new_images = image_names(info.images());
        let new_layers = layer_digests(info.images());

        self.touch(name);
        self.images.update_node(name, &old_images, &new_images);
        self.layers.update_node(name, &old_layers, &new_layers);
        Ok(())
    }

    fn add_pod_to_node(&mut self, pod: PodInfo) {
        let node_name = pod.node_name().to_string();
        self.pod_nodes.insert(pod.key().clone(), node_name.clone());
        self.nodes
            .entry(node_name.clone())
            .or_insert_with(NodeInfo::new)
            .add_pod(pod);
        self.touch(&node_name);
    }

    fn remove_pod_from_node(&mut self, key: &PodKey, node_name: &str) -> Option<PodInfo> {
        self.pod_nodes.remove(key);
        let info = self.nodes.get_mut(node_name)?;
        let removed = info.remove_pod(key)?;

        if info.node().is_none() && info.pods().is_empty() {
            let generation = info.generation();
            self.nodes.remove(node_name);
            self.generations.remove(&generation);
        } else {
            self.touch(node_name);
        }
        Some(removed)
    }

    /// Swap the cached copy of a pod for `pod`, moving it if its node changed
    fn replace_pod(&mut self, key: &PodKey, current_node: &str, pod: PodInfo) {
        if current_node != pod.node_name() {
            self.remove_pod_from_node(key, current_node);
            self.add_pod_to_node(pod);
            return;
        }

        match self.nodes.get_mut(current_node) {
            Some(info) => {
                info.remove_pod(key);
                info.add_pod(pod);
                self.touch(current_node);
            }
            None => self.add_pod_to_node(pod),
        }
    }

    fn forget_assumed(&mut self, key: &PodKey) -> Option<PodInfo> {
        let entry = self.assumed.forget(key)?;
        let node_name = self
            .pod_nodes
            .get(key)
            .cloned()
            .unwrap_or(entry.node_name);
        let mut removed = self.remove_pod_from_node(key, &node_name)?;
        removed.set_state(WorkloadState::Deleted);
        Some(removed)
    }
}

/// The scheduler's authoritative node and pod cache.
///
/// All mutations are serialized behind one write lock. Snapshots read it
/// under the read lock; see [`crate::Snapshot::update`].
#[derive(Debug)]
pub struct Cache {
    config: CacheConfig,
    state: RwLock<CacheState>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Cache {
    /// Create a new, empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState::new(config.assumed_pod_ttl)),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read()
    }

    /// Add a node. Adding a node that is already cached updates it.
    pub fn add_node(&self, node: Node) -> Result<()> {
        let name = node_name(&node)?.to_string();
        let mut state = self.state.write();

        if state.has_node(&name) {
            debug!("Node {} already cached, treating add as update", name);
        }
        state.set_node(&name, node)?;
        debug!("Added node {} (generation {})", name, state.generation);
        Ok(())
    }

    /// Replace a cached node's descriptor
    pub fn update_node(&self, node: Node) -> Result<()> {
        let name = node_name(&node)?.to_string();
        let mut state = self.state.write();

        if !state.has_node(&name) {
            return Err(CacheError::not_found("Node", name));
        }
        state.set_node(&name, node)?;
        debug!("Updated node {} (generation {})", name, state.generation);
        Ok(())
    }

    /// Remove a node and everything bound to it.
    ///
    /// Pods that were bound or assumed on the node are returned, tagged
    /// [`WorkloadState::Deleted`], so the caller can decide whether to
    /// reschedule them.
    pub fn remove_node(&self, name: &str) -> Result<Vec<PodInfo>> {
        let mut state = self.state.write();

        if !state.has_node(name) {
            return Err(CacheError::not_found("Node", name));
        }
        let Some(mut info) = state.nodes.remove(name) else {
            return Err(CacheError::not_found("Node", name));
        };

        state.generations.remove(&info.generation());
        if let Err(e) = state.node_tree.remove_node(name) {
            warn!("Node {} missing from ordering index: {}", name, e);
        }

        // removal still advances the cache generation
        state.next_generation();
        state
            .images
            .update_node(name, &image_names(info.images()), &Default::default());
        state
            .layers
            .update_node(name, &layer_digests(info.images()), &Default::default());

        let mut orphans = info.take_pods();
        for pod in &mut orphans {
            state.pod_nodes.remove(pod.key());
            state.assumed.forget(pod.key());
            pod.set_state(WorkloadState::Deleted);
        }

        if orphans.is_empty() {
            debug!("Removed node {}", name);
        } else {
            warn!(
                "Removed node {} with {} pods still bound to it",
                name,
                orphans.len()
            );
        }
        Ok(orphans)
    }

    /// Add a confirmed pod. Confirms the pod if it was assumed; a duplicate
    /// add on the same node is treated as an update.
    pub fn add_pod(&self, pod: Pod) -> Result<()> {
        let pod_info = PodInfo::new(pod, WorkloadState::Scheduled)?;
        let key = pod_info.key().clone();
        let mut state = self.state.write();

        match state.pod_nodes.get(&key).cloned() {
            Some(current) if state.assumed.contains(&key) => {
                state.assumed.forget(&key);
                if current != pod_info.node_name() {
                    warn!(
                        "Pod {} was assumed on node {} but confirmed on node {}",
                        key,
                        current,
                        pod_info.node_name()
                    );
                }
                debug!("Confirmed assumed pod {} on node {}", key, pod_info.node_name());
                state.replace_pod(&key, &current, pod_info);
            }
            Some(current) => {
                if current != pod_info.node_name() {
                    return Err(CacheError::already_exists("Pod", key.to_string()));
                }
                debug!("Pod {} already cached, treating add as update", key);
                state.replace_pod(&key, &current, pod_info);
            }
            None => {
                debug!("Added pod {} on node {}", key, pod_info.node_name());
                state.add_pod_to_node(pod_info);
            }
        }
        Ok(())
    }

    /// Update a confirmed pod. Assumed pods must be confirmed first.
    pub fn update_pod(&self, pod: Pod) -> Result<()> {
        let pod_info = PodInfo::new(pod, WorkloadState::Scheduled)?;
        let key = pod_info.key().clone();
        let mut state = self.state.write();

        match state.pod_nodes.get(&key).cloned() {
            Some(current) if !state.assumed.contains(&key) => {
                debug!("Updated pod {} on node {}", key, pod_info.node_name());
                state.replace_pod(&key, &current, pod_info);
                Ok(())
            }
            _ => Err(CacheError::not_found("Pod", key.to_string())),
        }
    }

    /// Remove a pod, assumed or confirmed. Returns the removed record.
    pub fn remove_pod(&self, pod: &Pod) -> Result<PodInfo> {
        let key = PodKey::from_pod(pod)?;
        let mut state = self.state.write();

        let current = state
            .pod_nodes
            .get(&key)
            .cloned()
            .ok_or_else(|| CacheError::not_found("Pod", key.to_string()))?;

        if let Some(reported) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            if reported != current {
                warn!(
                    "Pod {} removed from node {} but cached on node {}",
                    key, reported, current
                );
            }
        }

        state.assumed.forget(&key);
        let mut removed = state
            .remove_pod_from_node(&key, &current)
            .ok_or_else(|| CacheError::not_found("Pod", key.to_string()))?;
        removed.set_state(WorkloadState::Deleted);
        debug!("Removed pod {} from node {}", key, current);
        Ok(removed)
    }

    /// Optimistically place a pod on `spec.nodeName`, reserving its requests
    /// until the binding is confirmed, forgotten, or expires
    pub fn assume_pod(&self, pod: Pod) -> Result<()> {
        let pod_info = PodInfo::new(pod, WorkloadState::Assumed)?;
        let key = pod_info.key().clone();
        let mut state = self.state.write();

        if let Some(node) = state.pod_nodes.get(&key) {
            return Err(CacheError::already_bound(key.to_string(), node.clone()));
        }
        if !state.has_node(pod_info.node_name()) {
            return Err(CacheError::not_found("Node", pod_info.node_name()));
        }

        state
            .assumed
            .assume(key.clone(), pod_info.node_name(), Instant::now())?;
        debug!("Assumed pod {} on node {}", key, pod_info.node_name());
        state.add_pod_to_node(pod_info);
        Ok(())
    }

    /// Signal that the bind call for an assumed pod was issued; restarts its
    /// expiry deadline
    pub fn finish_binding(&self, pod: &Pod) -> Result<()> {
        let key = PodKey::from_pod(pod)?;
        self.state.write().assumed.finish_binding(&key, Instant::now())
    }

    /// Release an assumed pod and its reservation
    pub fn forget_pod(&self, pod: &Pod) -> Result<()> {
        let key = PodKey::from_pod(pod)?;
        let mut state = self.state.write();

        match state.forget_assumed(&key) {
            Some(released) => {
                debug!("Forgot assumed pod {} on node {}", key, released.node_name());
                Ok(())
            }
            None => Err(CacheError::not_found("AssumedPod", key.to_string())),
        }
    }

    pub fn is_assumed_pod(&self, pod: &Pod) -> Result<bool> {
        let key = PodKey::from_pod(pod)?;
        Ok(self.state.read().assumed.contains(&key))
    }

    /// Cached record of a pod
    pub fn get_pod(&self, pod: &Pod) -> Result<PodInfo> {
        let key = PodKey::from_pod(pod)?;
        let state = self.state.read();

        state
            .pod_nodes
            .get(&key)
            .and_then(|node| state.nodes.get(node))
            .and_then(|info| info.pod(&key))
            .cloned()
            .ok_or_else(|| CacheError::not_found("Pod", key.to_string()))
    }

    /// Number of nodes with a node object
    pub fn node_count(&self) -> usize {
        self.state.read().node_tree.num_nodes()
    }

    /// Number of pods, assumed ones included
    pub fn pod_count(&self) -> usize {
        self.state.read().pod_nodes.len()
    }

    /// Copy of every record, placeholders included
    pub fn dump(&self) -> CacheDump {
        let state = self.state.read();
        CacheDump {
            nodes: state.nodes.clone(),
            assumed_pods: state.assumed.keys().cloned().collect(),
        }
    }

    /// Forget every assumed pod whose deadline is at or before `now`.
    /// Returns the expired keys.
    pub fn cleanup_expired_assumed_pods(&self, now: Instant) -> Vec<PodKey> {
        let mut state = self.state.write();
        let expired = state.assumed.expired(now);

        for key in &expired {
            if let Some(released) = state.forget_assumed(key) {
                info!(
                    "Assumed pod {} on node {} expired without confirmation, releasing reservation",
                    key,
                    released.node_name()
                );
            }
        }
        expired
    }

    /// Run the assumed-pod expiry sweep until cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting scheduler cache sweep (interval: {:?}, ttl: {:?})",
            self.config.cleanup_interval, self.config.assumed_pod_ttl
        );

        // interval() panics on a zero period
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler cache sweep shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let expired = self.cleanup_expired_assumed_pods(Instant::now());
                    if !expired.is_empty() {
                        debug!("Expired {} assumed pods", expired.len());
                    }
                }
            }
        }
    }
}
