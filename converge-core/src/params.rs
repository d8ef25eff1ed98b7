//! Parameters for reads served from the local mirror.
use serde::{Deserialize, Serialize};

use crate::selector::{FieldSelector, Selector};

/// Options limiting a cached list operation.
///
/// All restrictions are evaluated locally against the mirror: the label
/// selector by linear filtering, the field selector through pre-registered
/// exact-match indexes, and `limit` by truncating the computed answer (the
/// cache is a full local mirror, not a paging source, so there is no
/// continuation token).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ListOptions {
    /// Restrict the answer to one namespace
    pub namespace: Option<String>,
    /// Restrict the answer by label selection
    pub label_selector: Option<Selector>,
    /// Restrict the answer by indexed exact-match field selection
    pub field_selector: Option<FieldSelector>,
    /// Truncate the answer to at most this many objects
    pub limit: Option<usize>,
}

impl ListOptions {
    /// Restrict the answer to one namespace
    #[must_use]
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Restrict the answer by label selection
    #[must_use]
    pub fn labels(mut self, selector: Selector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    /// Restrict the answer by indexed exact-match field selection
    #[must_use]
    pub fn fields(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    /// Truncate the answer to at most `limit` objects
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
