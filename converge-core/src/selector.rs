//! Local evaluation of label and field selectors.
#![allow(missing_docs)]
use std::{
    cmp::PartialEq,
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A label selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Equal(String, String),
    NotEqual(String, String),
    Exists(String),
    DoesNotExist(String),
}

/// Perform label selection on a list of expressions
///
/// Selection is evaluated locally against an object's label map; an empty
/// selector selects everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

impl Selector {
    /// Create a selector from a vector of expressions
    fn from_expressions(exprs: Expressions) -> Self {
        Self(exprs)
    }

    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Indicates whether this selector matches everything
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate the selector against a label map
    #[must_use]
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(
                    f,
                    "{key} in ({})",
                    values.iter().cloned().collect::<Vec<_>>().join(",")
                )
            }
            Expression::NotIn(key, values) => {
                write!(
                    f,
                    "{key} notin ({})",
                    values.iter().cloned().collect::<Vec<_>>().join(",")
                )
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

#[derive(Debug, Error, PartialEq)]
/// Failed to parse a field selector
pub enum ParseFieldSelectorError {
    /// The requirement used an operator other than `=`/`==`
    ///
    /// The local cache answers field selection through pre-registered
    /// exact-match indexes only, so inequality and set operators are
    /// rejected up front rather than silently returning wrong answers.
    #[error("unsupported field selector operator in {0:?}: only exact matches are supported")]
    UnsupportedOperator(String),
    /// The requirement was not a `key=value` pair
    #[error("invalid field selector requirement: {0:?}")]
    InvalidRequirement(String),
}

/// One exact-match field requirement
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldRequirement {
    /// Index name the requirement resolves through
    pub key: String,
    /// Required value
    pub value: String,
}

/// An exact-match field selector
///
/// Field selection against the local mirror is only honored through
/// pre-registered indexes, and only for equality; this type can therefore
/// only represent conjunctions of `key=value` requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldSelector(pub Vec<FieldRequirement>);

impl FieldSelector {
    /// Require `key` to equal `value`
    #[must_use]
    pub fn eq(key: &str, value: &str) -> Self {
        Self(vec![FieldRequirement {
            key: key.into(),
            value: value.into(),
        }])
    }

    /// Add a further exact-match requirement
    #[must_use]
    pub fn and(mut self, key: &str, value: &str) -> Self {
        self.0.push(FieldRequirement {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}

impl FromStr for FieldSelector {
    type Err = ParseFieldSelectorError;

    /// Parse the comma-separated `key=value` wire form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for raw in s.split(',').filter(|r| !r.is_empty()) {
            if raw.contains("!=") {
                return Err(ParseFieldSelectorError::UnsupportedOperator(raw.to_string()));
            }
            let (key, value) = raw
                .split_once("==")
                .or_else(|| raw.split_once('='))
                .ok_or_else(|| ParseFieldSelectorError::InvalidRequirement(raw.to_string()))?;
            if key.is_empty() {
                return Err(ParseFieldSelectorError::InvalidRequirement(raw.to_string()));
            }
            requirements.push(FieldRequirement {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self(requirements))
    }
}
