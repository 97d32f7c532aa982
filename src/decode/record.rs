//! Read-only view over one decoded row.

use std::sync::Arc;

use super::Header;
use crate::mux::SrcMeta;

/// One decoded row with its provenance.
///
/// Field lookups by out-of-range index or unknown name return `None`
/// rather than failing.
#[derive(Debug, Clone)]
pub struct Record {
    fields: Vec<String>,
    header: Arc<Header>,
    meta: SrcMeta,
}

impl Record {
    pub(crate) fn new(fields: Vec<String>, header: Arc<Header>, meta: SrcMeta) -> Self {
        Self {
            fields,
            header,
            meta,
        }
    }

    /// Field value at a positional index.
    pub fn by_index(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Field value for a header name.
    pub fn by_name(&self, name: &str) -> Option<&str> {
        self.header.index_of(name).and_then(|i| self.by_index(i))
    }

    /// Number of fields in this record.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The canonical header names this record was validated against.
    pub fn names(&self) -> &[String] {
        self.header.names()
    }

    /// The field values in order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Source metadata captured when this record was classified.
    pub fn meta(&self) -> &SrcMeta {
        &self.meta
    }
}
