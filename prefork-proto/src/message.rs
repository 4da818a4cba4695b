//! Protocol message types for spawner-worker communication.

use serde::{Deserialize, Serialize};

/// Request sent from a client to a running preloader.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SpawnRequest {
    /// Fork a worker from the preloaded image and relay its identity.
    Spawn,
}

/// Outcome of one application boot attempt, reported exactly once by the
/// process that performed the attempt, strictly before any other traffic.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum StatusMessage {
    /// The application image booted normally.
    Success,
    /// Boot raised a recoverable application-level fault.
    Exception(Fault),
    /// The application deliberately terminated the booting process.
    Exit,
}

/// Serialized application fault, preserving the originating fault's
/// category name and message text across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Fault {
    /// Category name of the originating fault (e.g. `ConfigError`).
    pub class: String,
    /// Human-readable fault message.
    pub message: String,
}

impl Fault {
    /// Creates a fault payload from a category name and message.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// Identity of a freshly launched worker, sent once its endpoint socket
/// exists. The owner-pipe descriptor follows as an out-of-band transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WorkerHello {
    /// Process id of the worker.
    pub pid: i32,
    /// Public name of the worker's request-serving endpoint.
    pub endpoint_name: String,
    /// Whether `endpoint_name` lives in the Linux abstract socket namespace.
    pub abstract_namespace: bool,
}

impl WorkerHello {
    /// Creates a worker greeting.
    #[must_use]
    pub fn new(pid: i32, endpoint_name: impl Into<String>, abstract_namespace: bool) -> Self {
        Self {
            pid,
            endpoint_name: endpoint_name.into(),
            abstract_namespace,
        }
    }
}
