// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler cache error type
#[derive(Error, Debug, Diagnostic)]
pub enum CacheError {
    /// Operation on an object the cache does not know
    #[error("{kind} not found in scheduler cache: {key}")]
    #[diagnostic(
        code(schedcache::not_found),
        help("The object was never added, or was already removed. Re-deliver the add event first")
    )]
    NotFound { kind: String, key: String },

    /// Assuming a pod the cache already tracks
    #[error("Pod {pod} is already bound to node {node}")]
    #[diagnostic(
        code(schedcache::already_bound),
        help("Forget or remove the pod before assuming it again")
    )]
    AlreadyBound { pod: String, node: String },

    /// Adding an object twice with conflicting state
    #[error("{kind} already exists in scheduler cache: {key}")]
    #[diagnostic(
        code(schedcache::already_exists),
        help("Send an update or a delete event instead of a second add")
    )]
    AlreadyExists { kind: String, key: String },

    /// Object is missing fields the cache needs
    #[error("Invalid object: {reason}")]
    #[diagnostic(
        code(schedcache::invalid_object),
        help("Nodes need metadata.name; cached pods also need spec.nodeName")
    )]
    InvalidObject { reason: String },

    /// Event payload could not be decoded
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(schedcache::serialization_error),
        help("Ensure the event object is a valid Node or Pod JSON document")
    )]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type for scheduler cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Create a NotFound error
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an AlreadyBound error
    pub fn already_bound(pod: impl Into<String>, node: impl Into<String>) -> Self {
        Self::AlreadyBound {
            pod: pod.into(),
            node: node.into(),
        }
    }

    /// Create an AlreadyExists error
    pub fn already_exists(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an InvalidObject error
    pub fn invalid_object(reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(message: impl Into<String>, source: Option<serde_json::Error>) -> Self {
        Self::Serialization {
            message: message.into(),
            source,
        }
    }

    /// Whether the error only means the object is unknown to the cache
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
