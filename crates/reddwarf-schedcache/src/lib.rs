//! Reddwarf Scheduler Cache - cluster state for scheduling cycles
//!
//! This crate provides:
//! - Node and pod cache with optimistic (assumed) bindings that expire
//! - Incremental per-cycle snapshots sharing unchanged nodes
//! - Image and layer locality summaries per node
//! - Zone-interleaved node ordering
//! - An adapter feeding watch events into the cache

pub mod assumed;
pub mod cache;
pub mod error;
pub mod events;
pub mod image_state;
pub mod node_info;
pub mod node_tree;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use cache::{Cache, CacheConfig, CacheDump};
pub use error::{CacheError, Result};
pub use events::{ClusterEvent, EventHandler, EventOutcome, RunExit, WatchEventType};
pub use image_state::{
    create_image_existence_map, create_layer_existence_map, get_node_image_states,
    layer_context_excluding, ImageExistenceMap, ImageRecord, ImageStateSummary,
    LayerExistenceMap,
};
pub use node_info::{NodeInfo, PodInfo};
pub use node_tree::NodeTree;
pub use snapshot::{Snapshot, SnapshotStats};
pub use types::{NodeSet, PodKey, Resource, WorkloadState};
