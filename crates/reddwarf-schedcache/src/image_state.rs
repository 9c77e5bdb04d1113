//! Image and layer locality state.
//!
//! The aggregation runs in two phases. The global pass builds, for every
//! image name (or layer digest), the set of nodes that report it. The
//! per-node pass walks one node's own images and looks each one up in the
//! global maps, producing an [`ImageStateSummary`] per image name.
//!
//! Inside the cache the global maps are kept up to date incrementally by
//! [`ExistenceIndex`] instead of being rebuilt on every snapshot.

use crate::node_info::NodeInfo;
use crate::types::NodeSet;
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Node annotation carrying per-image layer digests, as JSON
/// `{"<image name>": {"<layer digest>": <size bytes>}}`.
///
/// `ContainerImage` in node status has no layer information, so the node
/// agent publishes it here.
pub const IMAGE_LAYERS_ANNOTATION: &str = "node.reddwarf.io/image-layers";

/// Image name -> nodes that report the image
pub type ImageExistenceMap = HashMap<String, NodeSet>;

/// Layer digest -> nodes relevant to the current summarization
pub type LayerExistenceMap = HashMap<String, NodeSet>;

/// A container image as reported by a node's runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// All names (tags, digests) the image is known by
    pub names: Vec<String>,
    /// Total image size in bytes
    pub size_bytes: i64,
    /// Layer digest -> layer size in bytes
    pub layers: HashMap<String, i64>,
}

impl ImageRecord {
    pub fn new(name: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            names: vec![name.into()],
            size_bytes,
            layers: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn with_layer(mut self, digest: impl Into<String>, size_bytes: i64) -> Self {
        self.layers.insert(digest.into(), size_bytes);
        self
    }

    /// Images reported in a node's status, with layers taken from
    /// [`IMAGE_LAYERS_ANNOTATION`]. Images without any name are skipped.
    pub fn from_node(node: &Node) -> Vec<ImageRecord> {
        let node_name = node.metadata.name.as_deref().unwrap_or("unknown");

        let layers: HashMap<String, HashMap<String, i64>> = match node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(IMAGE_LAYERS_ANNOTATION))
        {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!(
                    "Ignoring malformed {} annotation on node {}: {}",
                    IMAGE_LAYERS_ANNOTATION, node_name, e
                );
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        node.status
            .as_ref()
            .and_then(|s| s.images.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|image| {
                let names = image.names.clone().unwrap_or_default();
                if names.is_empty() {
                    return None;
                }
                let image_layers = names
                    .iter()
                    .find_map(|n| layers.get(n))
                    .cloned()
                    .unwrap_or_default();
                Some(ImageRecord {
                    names,
                    size_bytes: image.size_bytes.unwrap_or(0),
                    layers: image_layers,
                })
            })
            .collect()
    }
}

/// Locality summary of one image on one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageStateSummary {
    /// Size of the image on this node
    pub size: i64,
    /// Number of nodes in the cluster that have the image
    pub num_nodes: usize,
    /// Layer digest -> nodes from the supplied layer context
    pub layers_on_nodes: HashMap<String, NodeSet>,
    /// Layer digest -> layer size on this node
    pub layers_size: HashMap<String, i64>,
}

/// Global pass: which nodes report each image name
pub fn create_image_existence_map<'a, I>(nodes: I) -> ImageExistenceMap
where
    I: IntoIterator<Item = &'a NodeInfo>,
{
    let mut map = ImageExistenceMap::new();
    for node in nodes {
        let Some(name) = node.name() else { continue };
        for image in node.images() {
            for image_name in &image.names {
                map.entry(image_name.clone()).or_default().insert(name);
            }
        }
    }
    map
}

/// Global pass over layers: which nodes report each layer digest
pub fn create_layer_existence_map<'a, I>(nodes: I) -> LayerExistenceMap
where
    I: IntoIterator<Item = &'a NodeInfo>,
{
    let mut map = LayerExistenceMap::new();
    for node in nodes {
        let Some(name) = node.name() else { continue };
        for image in node.images() {
            for digest in image.layers.keys() {
                map.entry(digest.clone()).or_default().insert(name);
            }
        }
    }
    map
}

/// Per-node pass: summarize each image the node reports.
///
/// `layer_existence` is used as given; the caller decides its scope. Names
/// present only in `image_existence` are never emitted.
pub fn get_node_image_states(
    images: &[ImageRecord],
    image_existence: &ImageExistenceMap,
    layer_existence: &LayerExistenceMap,
) -> HashMap<String, ImageStateSummary> {
    let mut states = HashMap::new();

    for image in images {
        let mut layers_on_nodes = HashMap::with_capacity(image.layers.len());
        let mut layers_size = HashMap::with_capacity(image.layers.len());
        for (digest, size) in &image.layers {
            layers_on_nodes.insert(
                digest.clone(),
                layer_existence.get(digest).cloned().unwrap_or_default(),
            );
            layers_size.insert(digest.clone(), *size);
        }

        for name in &image.names {
            let num_nodes = image_existence.get(name).map_or(0, NodeSet::len);
            states.insert(
                name.clone(),
                ImageStateSummary {
                    size: image.size_bytes,
                    num_nodes,
                    layers_on_nodes: layers_on_nodes.clone(),
                    layers_size: layers_size.clone(),
                },
            );
        }
    }

    states
}

/// Layer context for summarizing `node_name`: for every layer the node
/// holds, the other nodes holding it. The node itself is never included.
pub fn layer_context_excluding(
    node_name: &str,
    images: &[ImageRecord],
    layer_existence: &LayerExistenceMap,
) -> LayerExistenceMap {
    let mut context = LayerExistenceMap::new();
    for image in images {
        for digest in image.layers.keys() {
            if context.contains_key(digest) {
                continue;
            }
            let others = layer_existence
                .get(digest)
                .map(|set| set.without(node_name))
                .unwrap_or_default();
            context.insert(digest.clone(), others);
        }
    }
    context
}

/// Image names reported across a node's images
pub(crate) fn image_names(images: &[ImageRecord]) -> HashSet<String> {
    images.iter().flat_map(|i| i.names.iter().cloned()).collect()
}

/// Layer digests reported across a node's images
pub(crate) fn layer_digests(images: &[ImageRecord]) -> HashSet<String> {
    images
        .iter()
        .flat_map(|i| i.layers.keys().cloned())
        .collect()
}

/// Incrementally maintained existence map, kept by the cache so snapshots
/// never rescan every node
#[derive(Debug, Default)]
pub(crate) struct ExistenceIndex {
    sets: HashMap<String, NodeSet>,
}

impl ExistenceIndex {
    pub(crate) fn sets(&self) -> &HashMap<String, NodeSet> {
        &self.sets
    }

    pub(crate) fn get(&self, key: &str) -> Option<&NodeSet> {
        self.sets.get(key)
    }

    /// Move `node_name` from the keys in `old` to the keys in `new`
    pub(crate) fn update_node(
        &mut self,
        node_name: &str,
        old: &HashSet<String>,
        new: &HashSet<String>,
    ) {
        for key in old.difference(new) {
            let emptied = match self.sets.get_mut(key) {
                Some(set) => {
                    set.remove(node_name);
                    set.is_empty()
                }
                None => continue,
            };
            if emptied {
                self.sets.remove(key);
            }
        }

        for key in new.difference(old) {
            self.sets.entry(key.clone()).or_default().insert(node_name);
        }
    }
}
