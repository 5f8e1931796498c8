//! ASCII observation headers.
//!
//! A header is a block of `KEY VALUE` lines, NUL-terminated inside its slot:
//!
//! ```text
//! HDR_SIZE 4096
//! SOURCE   J0437-4715
//! NCHAN    1024
//! ```
//!
//! `HDR_SIZE` gives the logical length of the header in bytes.

use crate::error::HduError;
use std::fmt;
use std::str::FromStr;

pub const HDR_SIZE: &str = "HDR_SIZE";

/// Ordered `KEY VALUE` pairs. Lookups return the first occurrence of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsciiHeader {
    entries: Vec<(String, String)>,
}

impl AsciiHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses header text up to the first NUL. Blank lines and lines
    /// starting with `#` are skipped; a key without a value maps to "".
    pub fn parse(bytes: &[u8]) -> Self {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let text = String::from_utf8_lossy(&bytes[..end]);

        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k.to_string(), v.trim().to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The value of `key` parsed as `T`; `None` if absent or unparsable.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.parse().ok()
    }

    /// Replaces the first occurrence of `key`, or appends it.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Removes every occurrence of `key`, returning the first value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let first = self.get(key).map(str::to_string);
        self.entries.retain(|(k, _)| k != key);
        first
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

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Writes the header into `slot`, NUL-padding the rest.
    ///
    /// # Errors
    /// [`HduError::HeaderOverflow`] if the text plus its terminator does not
    /// fit.
    pub fn write_into(&self, slot: &mut [u8]) -> Result<usize, HduError> {
        let text = self.to_bytes();
        if text.len() >= slot.len() {
            return Err(HduError::HeaderOverflow {
                len: text.len() as u64,
                slot: slot.len() as u64,
            });
        }
        slot[..text.len()].copy_from_slice(&text);
        slot[text.len()..].fill(0);
        Ok(text.len())
    }
}

impl fmt::Display for AsciiHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            writeln!(f, "{k} {v}")?;
        }
        Ok(())
    }
}
