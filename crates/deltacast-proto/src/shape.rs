//! Recursive type descriptors for topic schemas.
//!
//! A shape describes the layout a topic's records are expected to
//! follow. It is descriptive only: instance records are open JSON
//! objects and the store never validates values against the shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A recursive descriptor of a topic's record layout.
///
/// `maxSize` carries the advertised capacity: the maximum character
/// count for strings, the fixed element count for the array kinds.
/// Shapes are immutable once attached to a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Shape {
    /// UTF-8 text bounded by `maxSize` characters.
    String {
        /// Maximum character count.
        #[serde(rename = "maxSize")]
        max_size: u32,
    },
    /// A single number.
    Number,
    /// A variable-length list of numbers.
    NumberArray,
    /// A fixed-capacity byte array.
    ByteArray {
        /// Fixed byte count.
        #[serde(rename = "maxSize")]
        max_size: u32,
    },
    /// A fixed-capacity array of floats.
    FloatArray {
        /// Fixed float count.
        #[serde(rename = "maxSize")]
        max_size: u32,
    },
    /// A record of named child shapes.
    Dict {
        /// Field name to child shape.
        children: BTreeMap<String, Shape>,
    },
}

impl Shape {
    /// Build a `dict` shape from field/child pairs.
    #[must_use]
    pub fn dict<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Shape)>,
        K: Into<String>,
    {
        Self::Dict {
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
