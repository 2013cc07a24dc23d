//! Lazy entry parsing over a line-oriented source

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem;
use std::path::Path;

use crate::{CoreError, Entry, Separator};

/// Iterator over the separator-terminated entries of a source.
///
/// Each line that is not exactly the separator is appended to the pending
/// entry with its `\n` restored. A separator line emits the pending entry,
/// even when it is empty. Text after the last separator is never emitted.
/// The stream is single-use; build a new one to re-read the source.
pub struct EntryStream<R> {
    reader: R,
    separator: Separator,
    line: Vec<u8>,
    pending: Vec<u8>,
    finished: bool,
}

impl EntryStream<BufReader<File>> {
    /// Open `path` for streaming
    pub fn open<P: AsRef<Path>>(path: P, separator: Separator) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CoreError::SourceOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), separator))
    }
}

impl<R: BufRead> EntryStream<R> {
    pub fn new(reader: R, separator: Separator) -> Self {
        Self {
            reader,
            separator,
            line: Vec::with_capacity(128),
            pending: Vec::with_capacity(512),
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for EntryStream<R> {
    type Item = Result<Entry, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    // unterminated trailing block is dropped
                    self.finished = true;
                    self.pending.clear();
                    return None;
                }
                Ok(_) => {
                    let content = strip_line_ending(&self.line);
                    if content == self.separator.as_bytes() {
                        return Some(Ok(Entry::new(mem::take(&mut self.pending))));
                    }
                    self.pending.extend_from_slice(content);
                    self.pending.push(b'\n');
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(CoreError::SourceRead(e)));
                }
            }
        }
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
