//! Query keys and their digests.
//!
//! A key digests to its compact JSON text. `serde_json` maps are sorted, so
//! object members never depend on insertion order, while array order is
//! part of the identity. Numbers JSON prints the same way (`1u64` and `1i64`)
//! share a digest; `1` and `1.0` do not.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Ordered, structurally compared identity of one cacheable unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// Build a key from a JSON value. Arrays become the key's parts, any
    /// other value becomes a one-part key.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(parts) => Self(parts),
            other => Self(vec![other]),
        }
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical identity string for this key.
    pub fn digest(&self) -> QueryDigest {
        let mut out = String::from("[");
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&part.to_string());
        }
        out.push(']');

        trace!("Digested query key {:?} -> {}", self.0, out);
        QueryDigest(out.into())
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl FromIterator<Value> for QueryKey {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonical string identity of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryDigest(Arc<str>);

impl QueryDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build a [`QueryKey`] from JSON-like parts.
///
/// ```
/// use querycache::query_key;
///
/// let key = query_key!["post", 1, { "draft": false }];
/// assert_eq!(key.digest().as_str(), r#"["post",1,{"draft":false}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:tt)*) => {
        $crate::QueryKey::new(match $crate::__private::serde_json::json!([$($part)*]) {
            $crate::__private::serde_json::Value::Array(parts) => parts,
            _ => ::std::vec::Vec::new(),
        })
    };
}
