//! Per-cycle view of the cache.
//!
//! A [`Snapshot`] is refreshed once per scheduling cycle and then read
//! without locking. Only records whose generation is newer than the
//! snapshot's stamp are copied again; everything else keeps sharing its
//! `Arc` with the previous cycle.
//!
//! Image summaries are computed when a node is copied. A node whose own
//! record did not change keeps the summaries of its last copy, so its
//! `num_nodes` and `layers_on_nodes` may lag behind images pulled or
//! dropped elsewhere until the node itself changes.

use crate::cache::{Cache, CacheState};
use crate::error::Result;
use crate::image_state::{
    create_image_existence_map, create_layer_existence_map, get_node_image_states,
    layer_context_excluding,
};
use crate::node_info::{NodeInfo, PodInfo};
use crate::node_tree::NodeTree;
use crate::types::{node_name, WorkloadState};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a call to [`Snapshot::update`] had to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Nodes copied because their record changed
    pub rematerialized: usize,
    /// Nodes dropped because they left the cache
    pub removed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    node_infos: HashMap<String, Arc<NodeInfo>>,
    /// Zone-interleaved order from the node tree
    node_order: Vec<String>,
    have_pods_with_affinity: Vec<String>,
    have_pods_with_required_anti_affinity: Vec<String>,
    /// Rotation offset into `node_order` for this cycle
    start: usize,
    generation: u64,
    tree_version: Option<u64>,
}

impl Snapshot {
    /// Empty snapshot; the first [`Snapshot::update`] copies every node
    pub fn new() -> Self {
        Self::default()
    }

    /// Standalone snapshot of plain objects, with image summaries computed
    /// over the whole input. Pods whose node is not in `nodes` are skipped.
    pub fn from_nodes(nodes: Vec<Node>, pods: Vec<Pod>) -> Result<Self> {
        let mut tree = NodeTree::new();
        let mut infos: HashMap<String, NodeInfo> = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let name = node_name(&node)?.to_string();
            tree.add_node(&node)?;
            infos.insert(name, NodeInfo::with_node(node));
        }

        for pod in pods {
            let pod = PodInfo::new(pod, WorkloadState::Scheduled)?;
            match infos.get_mut(pod.node_name()) {
                Some(info) => info.add_pod(pod),
                None => debug!(
                    "Skipping pod {} on unknown node {}",
                    pod.key(),
                    pod.node_name()
                ),
            }
        }

        let image_existence = create_image_existence_map(infos.values());
        let layer_existence = create_layer_existence_map(infos.values());

        let node_infos = infos
            .into_iter()
            .map(|(name, mut info)| {
                let layers = layer_context_excluding(&name, info.images(), &layer_existence);
                let states = get_node_image_states(info.images(), &image_existence, &layers);
                info.set_image_states(states);
                (name, Arc::new(info))
            })
            .collect();

        let mut snapshot = Self {
            node_infos,
            node_order: tree.list().to_vec(),
            tree_version: Some(tree.version()),
            ..Default::default()
        };
        snapshot.rebuild_affinity_lists();
        Ok(snapshot)
    }

    /// Bring the snapshot up to date with `cache`.
    ///
    /// Holds the cache read lock for the whole pass, so the result is one
    /// consistent point in time. Also advances the cache's node rotation by
    /// one slot.
    pub fn update(&mut self, cache: &Cache) -> SnapshotStats {
        let state = cache.read_state();
        let mut stats = SnapshotStats::default();
        let mut affinity_changed = false;

        for name in state
            .generations
            .range(self.generation + 1..)
            .map(|(_, name)| name)
        {
            // placeholders never enter a snapshot
            let Some(info) = state.nodes.get(name).filter(|i| i.node().is_some()) else {
                continue;
            };

            let fresh = Arc::new(summarize(name, info, &state));
            let had_affinity = self
                .node_infos
                .get(name)
                .map_or(true, |previous| has_affinity_pods(previous));
            affinity_changed |= had_affinity || has_affinity_pods(&fresh);

            self.node_infos.insert(name.clone(), fresh);
            stats.rematerialized += 1;
        }

        if self.node_infos.len() > state.node_tree.num_nodes() {
            let before = self.node_infos.len();
            self.node_infos.retain(|name, _| state.has_node(name));
            stats.removed = before - self.node_infos.len();
            affinity_changed = true;
        }

        let tree_version = state.node_tree.version();
        if self.tree_version != Some(tree_version) {
            self.node_order = state.node_tree.list().to_vec();
            self.tree_version = Some(tree_version);
            affinity_changed = true;
        }

        if affinity_changed {
            self.rebuild_affinity_lists();
        }

        self.start = state.node_tree.advance();
        self.generation = state.generation;

        debug!(
            "Snapshot at generation {}: {} rematerialized, {} removed",
            self.generation, stats.rematerialized, stats.removed
        );
        stats
    }

    /// Every node, starting at this cycle's rotation slot
    pub fn node_infos(&self) -> impl Iterator<Item = &Arc<NodeInfo>> + '_ {
        let len = self.node_order.len();
        (0..len).filter_map(move |i| {
            self.node_infos
                .get(&self.node_order[(self.start + i) % len])
        })
    }

    /// Nodes with at least one pod declaring pod affinity or anti-affinity
    pub fn node_infos_with_affinity(&self) -> impl Iterator<Item = &Arc<NodeInfo>> + '_ {
        self.have_pods_with_affinity
            .iter()
            .filter_map(|name| self.node_infos.get(name))
    }

    /// Nodes with at least one pod declaring required anti-affinity
    pub fn node_infos_with_required_anti_affinity(
        &self,
    ) -> impl Iterator<Item = &Arc<NodeInfo>> + '_ {
        self.have_pods_with_required_anti_affinity
            .iter()
            .filter_map(|name| self.node_infos.get(name))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NodeInfo>> {
        self.node_infos.get(name)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_infos.len()
    }

    /// Cache generation this snapshot reflects
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn rebuild_affinity_lists(&mut self) {
        self.have_pods_with_affinity.clear();
        self.have_pods_with_required_anti_affinity.clear();

        for name in &self.node_order {
            let Some(info) = self.node_infos.get(name) else {
                continue;
            };
            if info.has_pods_with_affinity() {
                self.have_pods_with_affinity.push(name.clone());
            }
            if info.has_pods_with_required_anti_affinity() {
                self.have_pods_with_required_anti_affinity
                    .push(name.clone());
            }
        }
    }
}

fn has_affinity_pods(info: &NodeInfo) -> bool {
    info.has_pods_with_affinity() || info.has_pods_with_required_anti_affinity()
}

/// Copy of a cache record with its image summaries filled in
fn summarize(name: &str, info: &NodeInfo, state: &CacheState) -> NodeInfo {
    let layers = layer_context_excluding(name, info.images(), state.layers.sets());
    let mut copy = info.clone();
    copy.set_image_states(get_node_image_states(
        info.images(),
        state.images.sets(),
        &layers,
    ));
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::image_state::IMAGE_LAYERS_ANNOTATION;
    use crate::node_info::tests::{create_test_node, create_test_pod, with_required_anti_affinity};
    use crate::types::Resource;
    use k8s_openapi::api::core::v1::ContainerImage;
    use std::collections::BTreeMap;

    fn node_with_image(name: &str, image: &str, layer: &str) -> Node {
        let mut node = create_test_node(name, "4", "8Gi");
        if let Some(status) = node.status.as_mut() {
            status.images = Some(vec![ContainerImage {
                names: Some(vec![image.to_string()]),
                size_bytes: Some(100),
            }]);
        }
        node.metadata.annotations = Some(BTreeMap::from([(
            IMAGE_LAYERS_ANNOTATION.to_string(),
            format!(r#"{{"{}": {{"{}": 60}}}}"#, image, layer),
        )]));
        node
    }

    fn names<'a>(infos: impl Iterator<Item = &'a Arc<NodeInfo>>) -> Vec<String> {
        infos
            .filter_map(|i| i.name().map(str::to_string))
            .collect()
    }

    fn cache_with_nodes(names: &[&str]) -> Cache {
        let cache = Cache::new(CacheConfig::default());
        for name in names {
            cache.add_node(create_test_node(name, "4", "8Gi")).unwrap();
        }
        cache
    }

    #[test]
    fn test_update_without_changes_copies_nothing() {
        let cache = cache_with_nodes(&["node1", "node2", "node3"]);
        let mut snapshot = Snapshot::new();

        let stats = snapshot.update(&cache);
        assert_eq!(stats.rematerialized, 3);
        assert_eq!(snapshot.num_nodes(), 3);

        let before: HashMap<String, Arc<NodeInfo>> = ["node1", "node2", "node3"]
            .iter()
            .map(|n| (n.to_string(), snapshot.get(n).unwrap().clone()))
            .collect();

        let stats = snapshot.update(&cache);
        assert_eq!(stats, SnapshotStats::default());
        for (name, info) in &before {
            assert!(Arc::ptr_eq(info, snapshot.get(name).unwrap()));
        }
    }

    #[test]
    fn test_update_copies_only_changed_nodes() {
        let cache = cache_with_nodes(&["node1", "node2"]);
        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);
        let node2 = snapshot.get("node2").unwrap().clone();

        cache
            .add_pod(create_test_pod("web", "node1", "1", "1Gi"))
            .unwrap();
        let stats = snapshot.update(&cache);

        assert_eq!(stats.rematerialized, 1);
        assert_eq!(snapshot.get("node1").unwrap().pods().len(), 1);
        assert!(Arc::ptr_eq(&node2, snapshot.get("node2").unwrap()));
    }

    #[test]
    fn test_generation_never_goes_backward() {
        let cache = cache_with_nodes(&["node1"]);
        let mut snapshot = Snapshot::new();

        snapshot.update(&cache);
        let first = snapshot.generation();
        assert!(first > 0);

        snapshot.update(&cache);
        assert_eq!(snapshot.generation(), first);

        cache
            .assume_pod(create_test_pod("web", "node1", "1", "1Gi"))
            .unwrap();
        snapshot.update(&cache);
        assert!(snapshot.generation() > first);
        assert_eq!(snapshot.get("node1").unwrap().requested().milli_cpu, 1000);
    }

    #[test]
    fn test_removed_nodes_are_dropped() {
        let cache = cache_with_nodes(&["node1", "node2", "node3"]);
        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);

        cache.remove_node("node2").unwrap();
        let stats = snapshot.update(&cache);

        assert_eq!(stats.removed, 1);
        assert_eq!(snapshot.num_nodes(), 2);
        assert!(snapshot.get("node2").is_none());
        assert_eq!(snapshot.node_infos().count(), 2);
    }

    #[test]
    fn test_remove_and_add_between_updates() {
        let cache = cache_with_nodes(&["node1", "node2"]);
        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);

        cache.remove_node("node1").unwrap();
        cache.add_node(create_test_node("node3", "4", "8Gi")).unwrap();
        let stats = snapshot.update(&cache);

        assert_eq!(stats.rematerialized, 1);
        assert_eq!(stats.removed, 1);
        let mut listed = names(snapshot.node_infos());
        listed.sort();
        assert_eq!(listed, ["node2", "node3"]);
    }

    #[test]
    fn test_placeholders_are_not_in_snapshot() {
        let cache = cache_with_nodes(&["node1"]);
        cache
            .add_pod(create_test_pod("web", "ghost", "1", "1Gi"))
            .unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);
        assert_eq!(snapshot.num_nodes(), 1);
        assert!(snapshot.get("ghost").is_none());
    }

    #[test]
    fn test_rotation_advances_each_update() {
        let cache = cache_with_nodes(&["node1", "node2", "node3"]);
        let mut snapshot = Snapshot::new();

        snapshot.update(&cache);
        assert_eq!(names(snapshot.node_infos()), ["node1", "node2", "node3"]);

        snapshot.update(&cache);
        assert_eq!(names(snapshot.node_infos()), ["node2", "node3", "node1"]);

        snapshot.update(&cache);
        assert_eq!(names(snapshot.node_infos()), ["node3", "node1", "node2"]);
    }

    #[test]
    fn test_affinity_lists() {
        let cache = cache_with_nodes(&["node1", "node2"]);
        let pod = with_required_anti_affinity(create_test_pod("db", "node2", "1", "1Gi"));
        cache.add_pod(pod.clone()).unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);
        assert_eq!(names(snapshot.node_infos_with_affinity()), ["node2"]);
        assert_eq!(
            names(snapshot.node_infos_with_required_anti_affinity()),
            ["node2"]
        );

        cache.remove_pod(&pod).unwrap();
        snapshot.update(&cache);
        assert_eq!(snapshot.node_infos_with_affinity().count(), 0);
        assert_eq!(snapshot.node_infos_with_required_anti_affinity().count(), 0);
    }

    #[test]
    fn test_image_summaries_computed_when_node_is_copied() {
        let cache = Cache::new(CacheConfig::default());
        cache
            .add_node(node_with_image("node-0", "app:1", "sha256:base"))
            .unwrap();
        cache.add_node(create_test_node("node-1", "4", "8Gi")).unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);
        let node0 = snapshot.get("node-0").unwrap().clone();
        let summary = &node0.image_states()["app:1"];
        assert_eq!(summary.num_nodes, 1);
        assert!(summary.layers_on_nodes["sha256:base"].is_empty());
        assert_eq!(summary.layers_size["sha256:base"], 60);

        // node-1 pulls the same image; only node-1 is copied
        cache
            .update_node(node_with_image("node-1", "app:1", "sha256:base"))
            .unwrap();
        let stats = snapshot.update(&cache);
        assert_eq!(stats.rematerialized, 1);
        assert!(Arc::ptr_eq(&node0, snapshot.get("node-0").unwrap()));

        let summary = &snapshot.get("node-1").unwrap().image_states()["app:1"];
        assert_eq!(summary.num_nodes, 2);
        let holders = &summary.layers_on_nodes["sha256:base"];
        assert!(holders.contains("node-0"));
        assert!(!holders.contains("node-1"));

        // node-0 picks up the new count the next time it changes
        cache
            .add_pod(create_test_pod("web", "node-0", "1", "1Gi"))
            .unwrap();
        snapshot.update(&cache);
        let summary = &snapshot.get("node-0").unwrap().image_states()["app:1"];
        assert_eq!(summary.num_nodes, 2);
        assert!(summary.layers_on_nodes["sha256:base"].contains("node-1"));
    }

    #[test]
    fn test_shared_image_does_not_copy_cluster() {
        let cache = Cache::new(CacheConfig::default());
        for i in 0..200 {
            cache
                .add_node(node_with_image(&format!("node-{}", i), "pause:3.9", "sha256:pause"))
                .unwrap();
        }

        let mut snapshot = Snapshot::new();
        assert_eq!(snapshot.update(&cache).rematerialized, 200);
        let before: Vec<Arc<NodeInfo>> = (0..200)
            .map(|i| snapshot.get(&format!("node-{}", i)).unwrap().clone())
            .collect();

        cache
            .add_node(node_with_image("node-new", "pause:3.9", "sha256:pause"))
            .unwrap();
        let stats = snapshot.update(&cache);

        assert_eq!(stats, SnapshotStats { rematerialized: 1, removed: 0 });
        for (i, info) in before.iter().enumerate() {
            assert!(Arc::ptr_eq(info, snapshot.get(&format!("node-{}", i)).unwrap()));
        }
        assert_eq!(
            snapshot.get("node-new").unwrap().image_states()["pause:3.9"].num_nodes,
            201
        );
    }

    #[test]
    fn test_every_reported_image_counts_its_own_node() {
        let cache = Cache::new(CacheConfig::default());
        cache
            .add_node(node_with_image("node-0", "app:1", "sha256:base"))
            .unwrap();
        cache
            .add_node(node_with_image("node-1", "app:1", "sha256:base"))
            .unwrap();
        cache
            .add_node(node_with_image("node-2", "db:5", "sha256:db"))
            .unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);

        let state = cache.read_state();
        for info in snapshot.node_infos() {
            let name = info.name().unwrap();
            assert!(!info.image_states().is_empty());
            for (image, summary) in info.image_states() {
                let holders = state.images.get(image).unwrap();
                assert!(holders.contains(name));
                assert!(summary.num_nodes >= 1);
                assert_eq!(summary.num_nodes, holders.len());
            }
        }
    }

    #[test]
    fn test_from_nodes() {
        let nodes = vec![
            node_with_image("node-0", "app:1", "sha256:base"),
            node_with_image("node-1", "app:1", "sha256:base"),
            create_test_node("node-2", "4", "8Gi"),
        ];
        let pods = vec![
            with_required_anti_affinity(create_test_pod("db", "node-1", "1", "1Gi")),
            create_test_pod("lost", "node-9", "1", "1Gi"),
        ];

        let snapshot = Snapshot::from_nodes(nodes, pods).unwrap();
        assert_eq!(snapshot.num_nodes(), 3);
        assert_eq!(names(snapshot.node_infos()), ["node-0", "node-1", "node-2"]);
        assert_eq!(names(snapshot.node_infos_with_affinity()), ["node-1"]);

        let summary = &snapshot.get("node-0").unwrap().image_states()["app:1"];
        assert_eq!(summary.num_nodes, 2);
        assert!(summary.layers_on_nodes["sha256:base"].contains("node-1"));
        assert!(snapshot.get("node-2").unwrap().image_states().is_empty());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_concurrent_writers_and_snapshots() {
        assert_send_sync::<Cache>();

        let cache = Arc::new(cache_with_nodes(&["node-0", "node-1", "node-2", "node-3"]));
        let mut handles = Vec::new();

        for writer in 0..3 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let pod = create_test_pod(
                        &format!("w{}-{}", writer, i),
                        &format!("node-{}", i % 4),
                        "100m",
                        "64Mi",
                    );
                    cache.add_pod(pod.clone()).unwrap();
                    if i % 2 == 0 {
                        cache.remove_pod(&pod).unwrap();
                    }
                }
            }));
        }

        {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let pod = create_test_pod(
                        &format!("assumed-{}", i),
                        &format!("node-{}", i % 4),
                        "250m",
                        "128Mi",
                    );
                    cache.assume_pod(pod.clone()).unwrap();
                    cache.forget_pod(&pod).unwrap();
                }
            }));
        }

        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let mut snapshot = Snapshot::new();
                let mut last_generation = 0;
                for _ in 0..300 {
                    snapshot.update(&cache);
                    assert!(snapshot.generation() >= last_generation);
                    last_generation = snapshot.generation();

                    for info in snapshot.node_infos() {
                        let mut sum = Resource::default();
                        for pod in info.pods() {
                            assert_eq!(Some(pod.node_name()), info.name());
                            sum += pod.requests();
                        }
                        assert_eq!(info.requested(), sum);
                    }
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.update(&cache);
        let pods: usize = snapshot.node_infos().map(|info| info.pods().len()).sum();
        assert_eq!(pods, 300);
        assert_eq!(cache.pod_count(), 300);
        assert!(cache.dump().assumed_pods.is_empty());
    }
}
