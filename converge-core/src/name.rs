//! Instance identity for named resources.
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The (namespace, name) identity of one resource instance.
///
/// `namespace` is `None` for cluster-scoped kinds. Note that a namespaced and
/// a cluster-scoped reference to the same name are not considered equal:
///
/// ```
/// use converge_core::NamespacedName;
/// assert_ne!(NamespacedName::new("foo"), NamespacedName::new("foo").within("bar"));
/// ```
///
/// This is also the ordinary work-item identity handed to reconcilers, though
/// the queue machinery accepts any comparable identity type.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    /// The name of the object
    pub name: String,
    /// The namespace of the object, if the kind is namespace-scoped
    pub namespace: Option<String>,
}

impl NamespacedName {
    /// Reference a cluster-scoped object by name
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Scope the reference to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NamespacedName;

    #[test]
    fn display_should_follow_expected_format() {
        assert_eq!(
            format!("{}", NamespacedName::new("my-widget").within("factory")),
            "my-widget.factory"
        );
        assert_eq!(format!("{}", NamespacedName::new("my-node")), "my-node");
    }
}
