//! Crate with the runtime components of the converge reconciliation engine
//!
//! This crate contains the core building blocks of declarative control
//! loops: per-kind informers feeding indexed local mirrors, a by-kind cache
//! dispatcher, event adapters turning store notifications into deduplicated
//! work items, and the work-queue controller driving user reconcilers with
//! bounded concurrency, retry-with-backoff, and panic isolation.
//!
//! Newcomers should generally get started with [`ControllerBuilder`], which
//! wires the queue internals up for you; the remaining modules are exposed
//! for composing the pipeline by hand.
#![deny(unsafe_code)]

pub mod cache;
pub mod controller;
pub mod event;
pub mod informer;
pub mod metrics;
pub mod rate_limit;
pub mod scheduler;
pub mod source;
pub mod trigger;
pub mod utils;
pub mod watcher;

pub use cache::{Cache, CacheConfig, Dispatcher, InformerCache};
pub use controller::{Action, Controller, ControllerBuilder, ReconcileError, Reconciler};
pub use event::Event;
pub use informer::{Informer, Store};
pub use metrics::Registry;
pub use scheduler::scheduler;
pub use source::RemoteSource;
pub use trigger::{trigger_self, trigger_with, Predicate};
pub use watcher::watcher;
