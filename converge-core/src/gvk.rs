//! Type identity for resource kinds.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse group version: {0}")]
/// Failed to parse group version.
pub struct ParseGroupVersionError(pub String);

/// The (group, version, kind) identity distinguishing one typed schema from another.
///
/// Two kinds are equal iff all three fields match, which makes `ResourceKind`
/// usable as an exact-match table key throughout the runtime.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// API group, empty for the core group
    pub group: String,
    /// Version within the group
    pub version: String,
    /// Kind name
    pub kind: String,
}

impl ResourceKind {
    /// Construct from explicit group, version, and kind
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Construct from a `group/version` string and a kind
    ///
    /// The core group is written as a bare version (`"v1"`).
    pub fn try_from_api_version(api_version: &str, kind: &str) -> Result<Self, ParseGroupVersionError> {
        let gv = GroupVersion::from_str(api_version)?;
        Ok(Self {
            group: gv.group,
            version: gv.version,
            kind: kind.to_string(),
        })
    }

    /// The `group/version` form used when addressing the remote source
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.version, self.group)
    }
}

/// Core information about a family of resource kinds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
}

impl GroupVersion {
    /// Construct from explicit group and version
    pub fn gv(group: &str, version: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
        }
    }
}

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    fn from_str(gv: &str) -> Result<Self, Self::Err> {
        let gvsplit = gv.splitn(2, '/').collect::<Vec<_>>();
        let (group, version) = match *gvsplit.as_slice() {
            [g, v] => (g.to_string(), v.to_string()), // standard case
            [v] => (String::new(), v.to_string()),    // core group case
            _ => return Err(ParseGroupVersionError(gv.into())),
        };
        if version.is_empty() {
            return Err(ParseGroupVersionError(gv.into()));
        }
        Ok(Self { group, version })
    }
}
