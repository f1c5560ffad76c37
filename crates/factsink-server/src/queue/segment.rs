//! Segment files backing the durable queue
//!
//! A segment is an append-only file of frames:
//!
//! ```text
//! +-----+-------------+-----------------+
//! | tag | len (u32 BE)| payload (len B) |
//! +-----+-------------+-----------------+
//! ```
//!
//! Tag `1` stores an item. Tag `2` is a removal marker with no payload; each
//! marker consumes one item from the front of the same segment. Replaying a
//! segment from the start therefore yields exactly the items still pending.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::QueueError;

const TAG_ITEM: u8 = 1;
const TAG_REMOVED: u8 = 2;
const HEADER_LEN: usize = 5;
const EXTENSION: &str = "seg";

/// One on-disk segment and the items it still holds
pub(crate) struct Segment {
    number: u64,
    path: PathBuf,
    file: File,
    file_len: u64,
    items: VecDeque<Vec<u8>>,
    /// Item frames ever written to this file
    written: usize,
    /// A later segment exists, so nothing more is appended here
    sealed: bool,
    sync_writes: bool,
}

impl Segment {
    pub(crate) fn file_name(number: u64) -> String {
        format!("{:020}.{}", number, EXTENSION)
    }

    pub(crate) fn parse_file_name(name: &str) -> Option<u64> {
        let stem = name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// Create a new, empty segment file
    pub(crate) fn create(dir: &Path, number: u64, sync_writes: bool) -> io::Result<Self> {
        let path = dir.join(Self::file_name(number));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        if sync_writes {
            File::open(dir)?.sync_all()?;
        }

        Ok(Self {
            number,
            path,
            file,
            file_len: 0,
            items: VecDeque::new(),
            written: 0,
            sealed: false,
            sync_writes,
        })
    }

    /// Replay an existing segment file
    ///
    /// A torn frame at the end of the file (a crash mid-append) is discarded
    /// and the file truncated back to the last complete frame.
    pub(crate) fn load(dir: &Path, number: u64, sync_writes: bool) -> Result<Self, QueueError> {
        let path = dir.join(Self::file_name(number));
        let data = fs::read(&path)?;

        let mut items = VecDeque::new();
        let mut written = 0;
        let mut pos = 0;

        while pos + HEADER_LEN <= data.len() {
            let tag = data[pos];
            let len = u32::from_be_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]])
                as usize;
            let end = pos + HEADER_LEN + len;
            if end > data.len() {
                break;
            }

            match tag {
                TAG_ITEM => {
                    items.push_back(data[pos + HEADER_LEN..end].to_vec());
                    written += 1;
                },
                TAG_REMOVED => {
                    if items.pop_front().is_none() {
                        return Err(QueueError::Corrupt {
                            path,
                            reason: format!("removal marker at offset {} has no item", pos),
                        });
                    }
                },
                other => {
                    return Err(QueueError::Corrupt {
                        path,
                        reason: format!("unknown frame tag {} at offset {}", other, pos),
                    });
                },
            }
            pos = end;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        if pos < data.len() {
            warn!(
                segment = %path.display(),
                valid_bytes = pos,
                discarded_bytes = data.len() - pos,
                "Discarding torn frame at end of queue segment"
            );
            file.set_len(pos as u64)?;
        }

        Ok(Self {
            number,
            path,
            file,
            file_len: pos as u64,
            items,
            written,
            sealed: false,
            sync_writes,
        })
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn pending(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// No further items may be appended
    pub(crate) fn is_full(&self, items_per_segment: usize) -> bool {
        self.sealed || self.written >= items_per_segment
    }

    /// Full and drained: the file can be deleted
    pub(crate) fn is_exhausted(&self, items_per_segment: usize) -> bool {
        self.is_full(items_per_segment) && self.items.is_empty()
    }

    pub(crate) fn push(&mut self, payload: Vec<u8>) -> Result<(), QueueError> {
        if payload.len() > u32::MAX as usize {
            return Err(QueueError::TooLarge(payload.len()));
        }
        self.write_frame(TAG_ITEM, &payload)?;
        self.items.push_back(payload);
        self.written += 1;
        Ok(())
    }

    /// Remove the front item, recording the removal on disk first
    pub(crate) fn pop(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        if self.items.is_empty() {
            return Ok(None);
        }
        self.write_frame(TAG_REMOVED, &[])?;
        Ok(self.items.pop_front())
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub(crate) fn remove(self) -> io::Result<()> {
        let Segment { path, file, .. } = self;
        drop(file);
        fs::remove_file(path)
    }

    fn write_frame(&mut self, tag: u8, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let result = self.file.write_all(&frame).and_then(|()| {
            if self.sync_writes {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                self.file_len += frame.len() as u64;
                Ok(())
            },
            Err(e) => {
                // Keep later frames readable by cutting off a partial write
                if let Err(trunc) = self.file.set_len(self.file_len) {
                    warn!(segment = %self.path.display(), error = %trunc, "Failed to roll back partial frame");
                }
                Err(e)
            },
        }
    }
}
