//! Sigrand Core - Entry parsing and uniform random selection
//!
//! This crate turns a flat signature file into a lazy stream of entries and
//! picks one of them uniformly at random in a single pass with constant
//! auxiliary memory. It knows nothing about pipes, lock files or signals.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;

mod reservoir;
mod stream;

pub use reservoir::Reservoir;
pub use stream::EntryStream;

/// Separator used by fortune-style signature files.
pub const DEFAULT_SEPARATOR: &str = "%%";

/// Errors that can occur while reading or selecting entries
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Cannot open entry source {path}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read entry source: {0}")]
    SourceRead(#[source] io::Error),
    #[error("Invalid separator {0:?}: must be non-empty and fit on a single line")]
    InvalidSeparator(String),
}

/// One selectable block of text.
///
/// Stored as raw bytes: signature files are not required to be UTF-8 and the
/// content is written to readers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry(Vec<u8>);

impl Entry {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Entry {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Entry {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

/// A validated separator line (compared without its line terminator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Separator(String);

impl Separator {
    pub fn new(token: impl Into<String>) -> Result<Self, CoreError> {
        let token = token.into();
        if token.is_empty() || token.contains(['\n', '\r']) {
            return Err(CoreError::InvalidSeparator(token));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for Separator {
    fn default() -> Self {
        Self(DEFAULT_SEPARATOR.to_string())
    }
}

impl fmt::Display for Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one pass over the entry source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// The winning entry, or `None` when the source held no entries
    pub entry: Option<Entry>,
    /// Number of entries observed
    pub seen: u64,
    /// How many times the candidate was replaced during the pass
    pub replacements: u64,
}

/// Read `path` from the start and pick one entry uniformly at random.
///
/// The generator is borrowed so that a single seeded instance can be reused
/// across calls. An empty source yields `Selection { entry: None, .. }`.
pub fn select_entry<P, R>(
    path: P,
    separator: &Separator,
    rng: &mut R,
) -> Result<Selection, CoreError>
where
    P: AsRef<Path>,
    R: Rng + ?Sized,
{
    let stream = EntryStream::open(path, separator.clone())?;
    let mut reservoir = Reservoir::new();
    let mut replacements = 0;

    for entry in stream {
        if reservoir.offer(entry?, rng) {
            replacements += 1;
        }
    }

    Ok(Selection {
        seen: reservoir.seen(),
        entry: reservoir.into_winner(),
        replacements,
    })
}
