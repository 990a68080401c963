//! HTTP/1.1 wire format.
//!
//! Pure conversions between raw bytes and structured messages:
//! - `parser`: request decoding (Content-Length and chunked framing)
//! - `response`: response building, encoding and error pages
//!
//! Nothing here touches sockets; the reactor feeds accumulated bytes in and
//! writes the encoded bytes out.

pub mod parser;
pub mod response;

pub use parser::{decode, decode_chunked, Leniency, Request};
pub use response::{error_response, Response, Status};

/// Header fields with case-insensitive names.
///
/// Keeps the casing of the first insertion and insertion order, which is the
/// order headers are encoded in. Inserting an existing name replaces its value,
/// so a message can never carry two conflicting values for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
