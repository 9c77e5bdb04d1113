use crate::error::{CacheError, Result};
use crate::types::PodKey;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// An optimistic binding waiting for confirmation
#[derive(Debug, Clone)]
pub struct AssumedEntry {
    /// Node the pod was assumed onto
    pub node_name: String,
    /// When the reservation lapses; `None` never expires
    pub deadline: Option<Instant>,
    /// Whether the bind call has been issued
    pub binding_finished: bool,
}

/// Tracks assumed pods and their deadlines.
///
/// The tracker only holds keys; the pod records themselves live on the
/// node they were assumed onto.
#[derive(Debug, Default)]
pub struct AssumedPods {
    entries: HashMap<PodKey, AssumedEntry>,
    ttl: Duration,
}

impl AssumedPods {
    /// Create a tracker; a zero `ttl` disables expiry
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn deadline_from(&self, now: Instant) -> Option<Instant> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(now + self.ttl)
        }
    }

    pub fn assume(&mut self, key: PodKey, node_name: impl Into<String>, now: Instant) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            return Err(CacheError::already_bound(
                key.to_string(),
                existing.node_name.clone(),
            ));
        }

        let entry = AssumedEntry {
            node_name: node_name.into(),
            deadline: self.deadline_from(now),
            binding_finished: false,
        };
        debug!(
            "Assumed pod {} on node {} (deadline {:?})",
            key, entry.node_name, entry.deadline
        );
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Restart the deadline once the bind call has gone out
    pub fn finish_binding(&mut self, key: &PodKey, now: Instant) -> Result<()> {
        let deadline = self.deadline_from(now);
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::not_found("AssumedPod", key.to_string()))?;
        entry.binding_finished = true;
        entry.deadline = deadline;
        Ok(())
    }

    /// Drop the entry, returning it if it existed
    pub fn forget(&mut self, key: &PodKey) -> Option<AssumedEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &PodKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &PodKey) -> Option<&AssumedEntry> {
        self.entries.get(key)
    }

    /// Keys whose deadline is at or before `now`
    pub fn expired(&self, now: Instant) -> Vec<PodKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PodKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn key(name: &str) -> PodKey {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        PodKey::from_pod(&pod).unwrap()
    }

    #[test]
    fn test_assume_twice_is_already_bound() {
        let mut assumed = AssumedPods::new(Duration::from_secs(30));
        let now = Instant::now();
        assumed.assume(key("web"), "node1", now).unwrap();

        let err = assumed.assume(key("web"), "node2", now).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyBound { ref node, .. } if node == "node1"));
        assert_eq!(assumed.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let mut assumed = AssumedPods::new(Duration::from_secs(30));
        let now = Instant::now();
        assumed.assume(key("web"), "node1", now).unwrap();
        assumed
            .assume(key("db"), "node1", now + Duration::from_secs(20))
            .unwrap();

        assert!(assumed.expired(now + Duration::from_secs(29)).is_empty());
        assert_eq!(assumed.expired(now + Duration::from_secs(30)), vec![key("web")]);
        assert_eq!(assumed.expired(now + Duration::from_secs(60)).len(), 2);
    }

    #[test]
    fn test_finish_binding_restarts_deadline() {
        let mut assumed = AssumedPods::new(Duration::from_secs(30));
        let now = Instant::now();
        assumed.assume(key("web"), "node1", now).unwrap();
        assumed
            .finish_binding(&key("web"), now + Duration::from_secs(20))
            .unwrap();

        let entry = assumed.get(&key("web")).unwrap();
        assert!(entry.binding_finished);
        assert!(assumed.expired(now + Duration::from_secs(45)).is_empty());
        assert_eq!(assumed.expired(now + Duration::from_secs(50)).len(), 1);

        assert!(assumed
            .finish_binding(&key("missing"), now)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let mut assumed = AssumedPods::new(Duration::ZERO);
        let now = Instant::now();
        assumed.assume(key("web"), "node1", now).unwrap();
        assert!(assumed.get(&key("web")).unwrap().deadline.is_none());
        assert!(assumed.expired(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_forget() {
        let mut assumed = AssumedPods::new(Duration::from_secs(30));
        assumed.assume(key("web"), "node1", Instant::now()).unwrap();
        let entry = assumed.forget(&key("web")).unwrap();
        assert_eq!(entry.node_name, "node1");
        assert!(assumed.is_empty());
        assert!(assumed.forget(&key("web")).is_none());
    }
}
