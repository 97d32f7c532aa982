//! Canonical header handling.

use snafu::prelude::*;
use std::collections::HashMap;

use crate::error::{DecodeError, DuplicateHeaderFieldSnafu};

/// The canonical, ordered field-name list for a decode session.
///
/// Names are unique (case-sensitive) and immutable once established.
/// A name-to-index table is built once so records can resolve field
/// lookups by name without scanning.
#[derive(Debug, Clone)]
pub struct Header {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    /// Build a header, rejecting duplicate field names.
    pub fn new(names: Vec<String>) -> Result<Self, DecodeError> {
        let mut index = HashMap::with_capacity(names.len());
        for (position, name) in names.iter().enumerate() {
            ensure!(
                index.insert(name.clone(), position).is_none(),
                DuplicateHeaderFieldSnafu { name: name.clone() }
            );
        }
        Ok(Self { names, index })
    }

    /// The field names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a field name, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// True when `row` matches this header exactly: same length and the
    /// same name at every position.
    pub fn matches(&self, row: &[String]) -> bool {
        self.names.len() == row.len() && self.names.iter().zip(row).all(|(a, b)| a == b)
    }
}
