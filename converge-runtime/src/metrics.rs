//! Runtime counters and the explicit controller registry.
use std::sync::{
    atomic::{AtomicU64, AtomicUsize},
    Arc,
};

use ahash::AHashMap;
use thiserror::Error;

/// Counters maintained by one running controller
///
/// All fields are plain atomics; exporting them to a metrics system is the
/// job of an outer layer.
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    /// Completed reconciliations that returned a success
    pub reconciliations: AtomicU64,
    /// Reconciliations that returned an error (terminal or not)
    pub failures: AtomicU64,
    /// Reconciliations dropped permanently due to a terminal error
    pub terminal_failures: AtomicU64,
    /// Reconciler invocations that panicked
    pub panics: AtomicU64,
    /// Requests currently queued or parked (gauge)
    pub queue_depth: AtomicUsize,
}

/// The name was already taken by another controller in this registry
#[derive(Debug, Error, PartialEq, Eq)]
#[error("controller name {0:?} is already registered")]
pub struct DuplicateControllerName(pub String);

/// An explicit registry of controller names and their counters
///
/// Controller names must be unique so their metrics do not collide. The
/// registry is a plain object owned by process bootstrap and passed to each
/// controller build, not a process-global singleton, which keeps the runtime
/// independently testable.
#[derive(Debug, Default)]
pub struct Registry {
    controllers: AHashMap<String, Arc<ControllerMetrics>>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` and hand out its counters
    pub fn register(&mut self, name: &str) -> Result<Arc<ControllerMetrics>, DuplicateControllerName> {
        if self.controllers.contains_key(name) {
            return Err(DuplicateControllerName(name.to_string()));
        }
        let metrics = Arc::new(ControllerMetrics::default());
        self.controllers.insert(name.to_string(), metrics.clone());
        Ok(metrics)
    }

    /// The counters registered under `name`, if any
    #[must_use]
    pub fn metrics(&self, name: &str) -> Option<Arc<ControllerMetrics>> {
        self.controllers.get(name).cloned()
    }
}
