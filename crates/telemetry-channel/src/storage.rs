// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed overflow store for batches that could not be delivered.
//!
//! Entries are written under a monotonically increasing sequence number so
//! lexicographic filename order is replay order, independent of wall-clock
//! time. A write lands in a `.tmp` file first and is renamed to its final
//! `.bin` name afterward, so a partially written entry is never visible to
//! the replay side. The store enforces a hard cap on the summed size of all
//! entries; a write that would exceed the cap is rejected and the telemetry
//! is counted as dropped by the caller.
//!
//! On-disk entry layout: the destination key terminated by `\n`, followed by
//! the already-compressed partition body.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_MAX_STORE_BYTES: u64 = 50 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("overflow store is full ({used} of {cap} bytes in use)")]
    Full { used: u64, cap: u64 },

    #[error("overflow store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted batch, loaded back from disk.
#[derive(Debug)]
pub struct OverflowEntry {
    pub key: String,
    /// Compressed partition body, ready for retransmission as-is.
    pub body: Vec<u8>,
    path: PathBuf,
}

impl OverflowEntry {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct OverflowStore {
    dir: PathBuf,
    max_bytes: u64,
    next_seq: AtomicU64,
    /// Serializes the cap check with the write it guards; without it two
    /// concurrent `persist` calls can both observe room and both write.
    write_lock: Mutex<()>,
    /// Statsbeat stores run quiet: their rejections must not spam operator
    /// logs on every interval during an outage.
    warn_on_reject: bool,
}

impl OverflowStore {
    /// Opens (or creates) a store directory and recovers existing state:
    /// leftover `.tmp` files from a crashed process are deleted, and the
    /// sequence counter resumes above the highest persisted entry so
    /// recovered files keep their replay priority.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        warn_on_reject: bool,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut max_seq: Option<u64> = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXTENSION) => {
                    debug!("Removing partial overflow entry {}", path.display());
                    let _ = fs::remove_file(&path);
                }
                Some(ENTRY_EXTENSION) => {
                    if let Some(seq) = parse_seq(&path) {
                        max_seq = Some(max_seq.map_or(seq, |m| m.max(seq)));
                    }
                }
                _ => {}
            }
        }

        Ok(OverflowStore {
            dir,
            max_bytes,
            next_seq: AtomicU64::new(max_seq.map_or(0, |m| m + 1)),
            write_lock: Mutex::new(()),
            warn_on_reject,
        })
    }

    /// Persists one batch. Rejects the write when it would push the summed
    /// entry sizes over the cap; existing entries are never evicted to make
    /// room, so during a sustained outage it is the newest telemetry that is
    /// dropped. Safe to call from concurrent flush loops.
    pub fn persist(&self, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let entry_len = key.len() as u64 + 1 + body.len() as u64;
        #[allow(clippy::expect_used)]
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let used = self.total_size()?;
        if used + entry_len > self.max_bytes {
            if self.warn_on_reject {
                warn!(
                    "Overflow store at {} is full ({used} of {} bytes), telemetry will be lost",
                    self.dir.display(),
                    self.max_bytes
                );
            }
            return Err(StorageError::Full {
                used,
                cap: self.max_bytes,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self.dir.join(format!("{seq:020}.{TEMP_EXTENSION}"));
        let final_path = self.dir.join(format!("{seq:020}.{ENTRY_EXTENSION}"));

        let mut contents = Vec::with_capacity(entry_len as usize);
        contents.extend_from_slice(key.as_bytes());
        contents.push(b'\n');
        contents.extend_from_slice(body);

        fs::write(&temp_path, contents)?;
        // The rename is what makes the entry visible to the replay side.
        fs::rename(&temp_path, &final_path)?;

        debug!(
            "Persisted {} byte batch for {key} to {}",
            body.len(),
            final_path.display()
        );
        Ok(())
    }

    /// Returns the oldest entry, or `None` when the store is drained.
    /// Unreadable or corrupt entries are deleted and skipped.
    pub fn peek_oldest(&self) -> Result<Option<OverflowEntry>, StorageError> {
        loop {
            let Some(path) = self.oldest_path()? else {
                return Ok(None);
            };
            match read_entry(&path) {
                Some(entry) => return Ok(Some(entry)),
                None => {
                    warn!("Discarding corrupt overflow entry {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// Deletes an entry after its successful retransmission.
    pub fn remove(&self, entry: &OverflowEntry) -> Result<(), StorageError> {
        fs::remove_file(&entry.path)?;
        Ok(())
    }

    /// Summed size of all visible entries.
    pub fn total_size(&self) -> Result<u64, StorageError> {
        let mut sum = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                sum += entry.metadata()?.len();
            }
        }
        Ok(sum)
    }

    pub fn entry_count(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir)? {
            if entry?.path().extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn oldest_path(&self) -> Result<Option<PathBuf>, StorageError> {
        let mut oldest: Option<PathBuf> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            // Sequence-numbered names make filename order replay order.
            if oldest.as_ref().map_or(true, |o| path.file_name() < o.file_name()) {
                oldest = Some(path);
            }
        }
        Ok(oldest)
    }
}

fn parse_seq(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_entry(path: &Path) -> Option<OverflowEntry> {
    let contents = fs::read(path).ok()?;
    let newline = contents.iter().position(|&b| b == b'\n')?;
    let key = String::from_utf8(contents[..newline].to_vec()).ok()?;
    if key.is_empty() {
        return None;
    }
    Some(OverflowEntry {
        key,
        body: contents[newline + 1..].to_vec(),
        path: path.to_path_buf(),
    })
}
