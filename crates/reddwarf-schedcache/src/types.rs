use crate::error::{CacheError, Result};
use k8s_openapi::api::core::v1::{Container, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{AddAssign, SubAssign};

/// Well-known zone label
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
/// Well-known region label
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
/// Deprecated zone label, still honoured when the GA label is missing
pub const LABEL_FAILURE_DOMAIN_ZONE: &str = "failure-domain.beta.kubernetes.io/zone";
/// Deprecated region label, still honoured when the GA label is missing
pub const LABEL_FAILURE_DOMAIN_REGION: &str = "failure-domain.beta.kubernetes.io/region";

/// A set of node names.
///
/// Used as the value type of the image and layer existence maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet(HashSet<String>);

impl NodeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning true if it was not present
    pub fn insert(&mut self, node_name: impl Into<String>) -> bool {
        self.0.insert(node_name.into())
    }

    /// Remove a node, returning true if it was present
    pub fn remove(&mut self, node_name: &str) -> bool {
        self.0.remove(node_name)
    }

    pub fn contains(&self, node_name: &str) -> bool {
        self.0.contains(node_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Copy of this set with one node left out
    pub fn without(&self, node_name: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|n| n.as_str() != node_name)
                .cloned()
                .collect(),
        )
    }
}

impl<S: Into<String>> FromIterator<S> for NodeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Identity of a pod inside the cache: its UID, or `namespace/name` when the
/// object carries no UID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey(String);

impl PodKey {
    /// Derive the key for a pod
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        if let Some(uid) = pod.metadata.uid.as_deref().filter(|u| !u.is_empty()) {
            return Ok(Self(uid.to_string()));
        }

        let name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| CacheError::invalid_object("pod has no metadata.name"))?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        Ok(Self(format!("{}/{}", namespace, name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle tag of a workload record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    /// Binding confirmed by the event source
    Scheduled,
    /// Optimistically placed, awaiting confirmation
    Assumed,
    /// Removed from the cache
    Deleted,
}

/// Resource quantities tracked per node and per pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resource {
    /// CPU in millicores (1000 = 1 core)
    pub milli_cpu: i64,
    /// Memory in bytes
    pub memory: i64,
    /// Pod slots
    pub pods: i64,
}

impl Resource {
    pub fn new(milli_cpu: i64, memory: i64, pods: i64) -> Self {
        Self {
            milli_cpu,
            memory,
            pods,
        }
    }

    /// Parse CPU string (e.g., "2", "1000m", "0.5")
    pub fn parse_cpu(s: &str) -> std::result::Result<i64, String> {
        if let Some(m) = s.strip_suffix('m') {
            m.parse::<i64>()
                .map_err(|e| format!("Invalid CPU millicore value: {}", e))
        } else if let Ok(cores) = s.parse::<f64>() {
            Ok((cores * 1000.0).round() as i64)
        } else {
            Err(format!("Invalid CPU format: {}", s))
        }
    }

    /// Parse memory string (e.g., "128Mi", "1Gi", "500M", "1024")
    pub fn parse_memory(s: &str) -> std::result::Result<i64, String> {
        const SUFFIXES: &[(&str, i64)] = &[
            ("Ki", 1 << 10),
            ("Mi", 1 << 20),
            ("Gi", 1 << 30),
            ("Ti", 1 << 40),
            ("Pi", 1 << 50),
            ("k", 1_000),
            ("M", 1_000_000),
            ("G", 1_000_000_000),
            ("T", 1_000_000_000_000),
            ("P", 1_000_000_000_000_000),
        ];

        let (number, multiplier) = SUFFIXES
            .iter()
            .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
            .unwrap_or((s, 1));

        if let Ok(n) = number.parse::<i64>() {
            return n
                .checked_mul(multiplier)
                .ok_or_else(|| format!("Memory value overflows: {}", s));
        }

        number
            .parse::<f64>()
            .map(|n| (n * multiplier as f64) as i64)
            .map_err(|_| format!("Invalid memory format: {}", s))
    }

    /// Read cpu, memory and pods from a k8s resource map (capacity,
    /// allocatable or container requests). Unparseable entries count as zero.
    pub fn from_quantities(resources: &BTreeMap<String, Quantity>) -> Self {
        let milli_cpu = resources
            .get("cpu")
            .and_then(|q| Self::parse_cpu(&q.0).ok())
            .unwrap_or(0);

        let memory = resources
            .get("memory")
            .and_then(|q| Self::parse_memory(&q.0).ok())
            .unwrap_or(0);

        let pods = resources
            .get("pods")
            .and_then(|q| q.0.parse::<i64>().ok())
            .unwrap_or(0);

        Self {
            milli_cpu,
            memory,
            pods,
        }
    }

    /// Allocatable resources of a node
    pub fn node_allocatable(node: &Node) -> Self {
        node.status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .map(Self::from_quantities)
            .unwrap_or_default()
    }

    /// Effective request of a pod: the sum over its containers, raised to the
    /// largest single init container request, plus one pod slot
    pub fn pod_requests(pod: &Pod) -> Self {
        let Some(spec) = pod.spec.as_ref() else {
            return Self::new(0, 0, 1);
        };

        let mut total = Self::default();
        for container in &spec.containers {
            total += container_requests(container);
        }

        for init in spec.init_containers.iter().flatten() {
            let req = container_requests(init);
            total.milli_cpu = total.milli_cpu.max(req.milli_cpu);
            total.memory = total.memory.max(req.memory);
        }

        total.pods = 1;
        total
    }

    /// Component-wise difference, clamped at zero
    pub fn saturating_sub(&self, other: &Resource) -> Self {
        Self {
            milli_cpu: (self.milli_cpu - other.milli_cpu).max(0),
            memory: (self.memory - other.memory).max(0),
            pods: (self.pods - other.pods).max(0),
        }
    }
}

fn container_requests(container: &Container) -> Resource {
    container
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .map(|requests| {
            let mut r = Resource::from_quantities(requests);
            r.pods = 0;
            r
        })
        .unwrap_or_default()
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Self) {
        self.milli_cpu += rhs.milli_cpu;
        self.memory += rhs.memory;
        self.pods += rhs.pods;
    }
}

impl SubAssign for Resource {
    fn sub_assign(&mut self, rhs: Self) {
        self.milli_cpu -= rhs.milli_cpu;
        self.memory -= rhs.memory;
        self.pods -= rhs.pods;
    }
}

/// Zone grouping key of a node: region and zone labels joined, or the empty
/// string for nodes without topology labels
pub fn zone_key(node: &Node) -> String {
    let Some(labels) = node.metadata.labels.as_ref() else {
        return String::new();
    };

    let region = labels
        .get(LABEL_TOPOLOGY_REGION)
        .or_else(|| labels.get(LABEL_FAILURE_DOMAIN_REGION))
        .map(String::as_str)
        .unwrap_or_default();
    let zone = labels
        .get(LABEL_TOPOLOGY_ZONE)
        .or_else(|| labels.get(LABEL_FAILURE_DOMAIN_ZONE))
        .map(String::as_str)
        .unwrap_or_default();

    if region.is_empty() && zone.is_empty() {
        return String::new();
    }

    // NUL cannot appear in label values, so the join is unambiguous
    format!("{}:\x00:{}", region, zone)
}

/// Name of a node, or an InvalidObject error
pub fn node_name(node: &Node) -> Result<&str> {
    node.metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CacheError::invalid_object("node has no metadata.name"))
}
