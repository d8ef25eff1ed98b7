//! Kind-tagged objects for resource kinds not known at compile-time.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{gvk::ResourceKind, name::NamespacedName};

#[derive(Debug, Error)]
#[error("failed to parse this Object into the requested type: {source}")]
/// Failed to parse an [`Object`] into a typed representation
pub struct ParseObjectError {
    #[from]
    source: serde_json::Error,
}

/// Metadata common to all mirrored resources.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// The name of the object, unique within its namespace
    pub name: Option<String>,
    /// The namespace of the object, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Opaque server-assigned identity, stable across updates
    pub uid: Option<String>,
    /// Opaque version token, changes on every write
    pub resource_version: Option<String>,
    /// Spec generation, bumped only on spec changes
    pub generation: Option<i64>,
    /// String key/value pairs usable in label selection
    pub labels: BTreeMap<String, String>,
    /// String key/value pairs not usable in selection
    pub annotations: BTreeMap<String, String>,
}

/// A dynamic representation of one mirrored resource.
///
/// Entries in the local cache are kind-tagged: the [`ResourceKind`] travels
/// with the object, so a cache read never needs out-of-band type context.
/// The payload beyond metadata is carried as raw [`serde_json::Value`] and
/// can be projected into a typed struct with [`Object::try_parse`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Object {
    /// The kind identity of this object
    pub kind: ResourceKind,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// All other fields
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Object {
    /// Create an `Object` with minimal values set for the given kind
    #[must_use]
    pub fn new(name: &str, kind: &ResourceKind) -> Self {
        Self {
            kind: kind.clone(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::Value::Null,
        }
    }

    /// Attach a payload to the object
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to the object
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Attach a resource version to the object
    #[must_use]
    pub fn at_version(mut self, rv: &str) -> Self {
        self.metadata.resource_version = Some(rv.into());
        self
    }

    /// Attach a label to the object
    #[must_use]
    pub fn labeled(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// The identity this object is stored under, if it carries a name
    #[must_use]
    pub fn to_ref(&self) -> Option<NamespacedName> {
        Some(NamespacedName {
            name: self.metadata.name.clone()?,
            namespace: self.metadata.namespace.clone(),
        })
    }

    /// Attempt to convert the payload into a typed representation
    pub fn try_parse<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ParseObjectError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
