//! Decoded record and header value types.
//!
//! The wire codec produces these; the dispatch tree and topic cache
//! consume them. Byte payloads are `bytes::Bytes` so records can be
//! fanned out to many consumers without copying.

use bytes::Bytes;

/// A single decoded record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header name.
    pub name: Bytes,
    /// Header value.
    pub value: Bytes,
}

/// The headers of one record, with multi-value lookup by name.
///
/// Kafka permits the same header name to appear more than once; matching
/// is therefore "any value under this name".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<RecordHeader>);

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a header.
    pub fn push(&mut self, name: Bytes, value: Bytes) {
        self.0.push(RecordHeader { name, value });
    }

    /// Returns the number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates all headers in record order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordHeader> {
        self.0.iter()
    }

    /// Iterates the values recorded under `name`, in record order.
    pub fn values_of<'a>(&'a self, name: &'a [u8]) -> impl Iterator<Item = &'a Bytes> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.as_ref() == name)
            .map(|h| &h.value)
    }

    /// Returns true if any value under `name` equals `value` exactly.
    #[must_use]
    pub fn matches(&self, name: &[u8], value: &[u8]) -> bool {
        self.values_of(name).any(|v| v.as_ref() == value)
    }
}

impl FromIterator<(Bytes, Bytes)> for Headers {
    fn from_iter<T: IntoIterator<Item = (Bytes, Bytes)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| RecordHeader { name, value })
                .collect(),
        )
    }
}

/// One decoded record from a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Absolute offset of the record within its partition.
    pub offset: crate::Offset,
    /// Record timestamp in milliseconds.
    pub timestamp: i64,
    /// Record key, if any. A null key matches only unkeyed filters.
    pub key: Option<Bytes>,
    /// Record headers.
    pub headers: Headers,
    /// Record value. `None` is a tombstone on compacted topics.
    pub value: Option<Bytes>,
}
