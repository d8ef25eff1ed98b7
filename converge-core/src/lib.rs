//! Crate with the shared types of the converge reconciliation runtime
//!
//! This crate is available as a minimal alternative to `converge-runtime` where
//! only the data model is needed: kind identities, object metadata, dynamic
//! objects, and locally-evaluated selectors.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod gvk;
pub use gvk::{GroupVersion, ParseGroupVersionError, ResourceKind};

pub mod name;
pub use name::NamespacedName;

pub mod object;
pub use object::{Object, ObjectMeta, ParseObjectError};

pub mod params;
pub use params::ListOptions;

pub mod selector;
pub use selector::{Expression, FieldSelector, ParseFieldSelectorError, Selector};
