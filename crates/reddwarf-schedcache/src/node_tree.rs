//! Zone-aware iteration order over node names.
//!
//! Nodes are grouped by zone key and the order interleaves zones: the first
//! node of every zone, then the second node of every zone, and so on. A
//! cursor walks that order cyclically. Structural changes re-derive the
//! order and put the cursor back on the node that was due next, so a
//! removal only takes out the removed node's slot.

use crate::error::{CacheError, Result};
use crate::types::{node_name, zone_key};
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct NodeTree {
    /// Zone keys in first-seen order
    zones: Vec<String>,
    /// Zone key -> node names in insertion order
    tree: HashMap<String, Vec<String>>,
    /// Node name -> zone key
    node_zones: HashMap<String, String>,
    /// Zone-interleaved order
    order: Vec<String>,
    cursor: AtomicUsize,
    /// Bumped on every structural change
    version: u64,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, or move it if its zone labels changed. Re-adding a node
    /// in the same zone is a no-op.
    pub fn add_node(&mut self, node: &Node) -> Result<()> {
        let name = node_name(node)?.to_string();
        let zone = zone_key(node);

        match self.node_zones.get(&name).cloned() {
            Some(current) if current == zone => return Ok(()),
            Some(_) => {
                let anchor = self.upcoming(Some(&name));
                self.detach(&name);
                self.attach(name, zone);
                self.rebuild(anchor);
            }
            None => {
                let anchor = self.upcoming(None);
                self.attach(name, zone);
                self.rebuild(anchor);
            }
        }

        Ok(())
    }

    /// Same as [`NodeTree::add_node`]; a zone change re-slots the node
    pub fn update_node(&mut self, node: &Node) -> Result<()> {
        self.add_node(node)
    }

    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        if !self.node_zones.contains_key(name) {
            return Err(CacheError::not_found("Node", name));
        }

        let anchor = self.upcoming(Some(name));
        self.detach(name);
        self.rebuild(anchor);
        Ok(())
    }

    /// Next node in the rotation. Cycles forever; `None` only when empty.
    pub fn next(&self) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.order.len();
        Some(self.order[index].clone())
    }

    /// Position of the node [`NodeTree::next`] would return, advancing the
    /// cursor past it
    pub(crate) fn advance(&self) -> usize {
        if self.order.is_empty() {
            return 0;
        }
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.order.len()
    }

    /// Zone-interleaved order, not rotated
    pub fn list(&self) -> &[String] {
        &self.order
    }

    pub fn num_nodes(&self) -> usize {
        self.order.len()
    }

    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    fn attach(&mut self, name: String, zone: String) {
        debug!("Adding node {} to zone {:?}", name, zone);
        if !self.tree.contains_key(&zone) {
            self.zones.push(zone.clone());
        }
        self.tree.entry(zone.clone()).or_default().push(name.clone());
        self.node_zones.insert(name, zone);
    }

    fn detach(&mut self, name: &str) {
        let Some(zone) = self.node_zones.remove(name) else {
            return;
        };

        let emptied = match self.tree.get_mut(&zone) {
            Some(nodes) => {
                nodes.retain(|n| n != name);
                nodes.is_empty()
            }
            None => false,
        };

        if emptied {
            self.tree.remove(&zone);
            self.zones.retain(|z| *z != zone);
        }
    }

    /// Node that would be returned next, skipping `skip`
    fn upcoming(&self, skip: Option<&str>) -> Option<String> {
        let len = self.order.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % len;
        (0..len)
            .map(|i| &self.order[(start + i) % len])
            .find(|n| Some(n.as_str()) != skip)
            .cloned()
    }

    fn rebuild(&mut self, anchor: Option<String>) {
        let mut order = Vec::with_capacity(self.node_zones.len());
        let mut index = 0;
        while order.len() < self.node_zones.len() {
            for zone in &self.zones {
                if let Some(name) = self.tree.get(zone).and_then(|nodes| nodes.get(index)) {
                    order.push(name.clone());
                }
            }
            index += 1;
        }
        self.order = order;

        let position = anchor
            .and_then(|a| self.order.iter().position(|n| *n == a))
            .unwrap_or(0);
        *self.cursor.get_mut() = position;
        self.version += 1;
    }
}
