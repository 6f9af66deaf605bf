//! Disk-backed offline queue
//!
//! Batches that could not be delivered are written here and re-sent later by
//! the dispatcher's reconciliation step.
//!
//! ## Layout
//!
//! ```text
//! offline-queue/
//! ├── 00001715170000123456-3fa2c1d0.json   (oldest)
//! ├── 00001715170000123457-9b0e77aa.json
//! └── 00001715170004000001-01c3f5e2.json   (newest)
//! ```
//!
//! Each slot holds one JSON [`TestBatch`]. The name is a zero-padded
//! microsecond timestamp plus a random suffix, and the sorted directory listing
//! is the FIFO order. There is no index file.
//!
//! ## Guarantees
//!
//! - Writes go to a `.tmp` file first and are renamed into place.
//! - A partially consumed slot is rewritten with its remainder before the
//!   call returns, so a crash can cause re-delivery but never loss.
//! - Unparsable slots are deleted when encountered.
//! - All operations on one instance are serialized by a mutex. Sharing a
//!   directory between processes is not supported.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::types::{TestBatch, TestExecution};

const SLOT_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// File-backed FIFO of undelivered batches
pub struct OfflineQueue {
    dir: PathBuf,
    capacity: usize,
    state: Mutex<QueueState>,
}

struct QueueState {
    /// Last timestamp handed out, keeps slot names strictly increasing
    last_stamp: u64,
}

impl OfflineQueue {
    /// Open (creating if needed) a queue rooted at `dir` holding at most
    /// `capacity` records.
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let last_stamp = list_slots(&dir)?
            .last()
            .and_then(|path| slot_stamp(path))
            .unwrap_or(0);

        debug!(dir = %dir.display(), capacity, "Opened offline queue");

        Ok(Self {
            dir,
            capacity,
            state: Mutex::new(QueueState { last_stamp }),
        })
    }

    /// Open the queue described by `config`
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Self::open(config.resolved_directory(), config.max_records)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Maximum number of records held on disk
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Persist `batch` as a new slot.
    ///
    /// Fails with `CapacityExceeded` when the queue would exceed its record
    /// capacity; nothing is written in that case.
    pub fn enqueue(&self, batch: &TestBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.lock();

        let queued = self.count_records()?;
        if queued + batch.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                queued,
                incoming: batch.len(),
                capacity: self.capacity,
            });
        }

        let path = self.next_slot_path(&mut state);
        write_atomic(&path, batch)?;

        debug!(
            batch_id = %batch.batch_id,
            records = batch.len(),
            slot = %path.display(),
            "Enqueued batch offline"
        );
        Ok(())
    }

    /// Take up to `max_count` records, oldest first.
    ///
    /// Fully consumed slots are deleted only after any partially consumed
    /// slot has been rewritten with its remaining records. Once some records
    /// have been taken, a later I/O failure ends the scan early and the
    /// records gathered so far are returned; slots that could not be deleted
    /// stay on disk and are delivered again.
    pub fn dequeue(&self, max_count: usize) -> Result<Vec<TestExecution>> {
        let _state = self.lock();
        let mut taken = Vec::new();

        if max_count == 0 {
            return Ok(taken);
        }

        let mut consumed = Vec::new();
        for path in list_slots(&self.dir)? {
            let mut batch = match read_slot(&path) {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) if taken.is_empty() => return Err(e),
                Err(e) => {
                    warn!(slot = %path.display(), error = %e, "Stopped offline dequeue early");
                    break;
                }
            };

            let wanted = max_count - taken.len();
            if batch.len() <= wanted {
                taken.append(&mut batch.executions);
                consumed.push(path);
            } else {
                let mut head = batch.executions;
                batch.executions = head.split_off(wanted);
                match write_atomic(&path, &batch) {
                    Ok(()) => {
                        taken.append(&mut head);
                        debug!(
                            slot = %path.display(),
                            remaining = batch.len(),
                            "Rewrote partially consumed slot"
                        );
                    }
                    Err(e) if taken.is_empty() => return Err(e),
                    Err(e) => {
                        warn!(slot = %path.display(), error = %e, "Stopped offline dequeue early");
                        break;
                    }
                }
            }

            if taken.len() >= max_count {
                break;
            }
        }

        for path in consumed {
            if let Err(e) = remove_if_exists(&path) {
                warn!(
                    slot = %path.display(),
                    error = %e,
                    "Failed to delete consumed offline slot"
                );
            }
        }

        Ok(taken)
    }

    /// Total queued records across all slots
    pub fn size(&self) -> Result<usize> {
        let _state = self.lock();
        self.count_records()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Number of slot files currently on disk
    pub fn slot_count(&self) -> Result<usize> {
        let _state = self.lock();
        Ok(list_slots(&self.dir)?.len())
    }

    /// Delete slots (and stray temp files) last modified more than `max_age`
    /// ago. Returns how many files were removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let _state = self.lock();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_queue_file(&path) {
                continue;
            }

            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                remove_if_exists(&path)?;
                removed += 1;
                warn!(
                    slot = %path.display(),
                    age_secs = age.as_secs(),
                    "Discarded expired offline slot"
                );
            }
        }

        Ok(removed)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caller must hold the lock.
    fn count_records(&self) -> Result<usize> {
        let mut total = 0;
        for path in list_slots(&self.dir)? {
            if let Some(batch) = read_slot(&path)? {
                total += batch.len();
            }
        }
        Ok(total)
    }

    fn next_slot_path(&self, state: &mut QueueState) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let stamp = now.max(state.last_stamp + 1);
        state.last_stamp = stamp;

        let suffix: u32 = rand::random();
        self.dir
            .join(format!("{:020}-{:08x}.{}", stamp, suffix, SLOT_EXTENSION))
    }
}

fn is_slot(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SLOT_EXTENSION)
}

fn is_queue_file(path: &Path) -> bool {
    is_slot(path) || path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION)
}

/// Slot files sorted oldest first
fn list_slots(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut slots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if is_slot(&path) && entry.file_type()?.is_file() {
            slots.push(path);
        }
    }
    slots.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(slots)
}

/// Timestamp prefix of a slot name
fn slot_stamp(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

/// Read a slot, deleting it if it cannot be parsed
fn read_slot(path: &Path) -> Result<Option<TestBatch>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<TestBatch>(&content) {
        Ok(batch) => Ok(Some(batch)),
        Err(e) => {
            warn!(
                slot = %path.display(),
                error = %e,
                "Deleting unreadable offline slot"
            );
            remove_if_exists(path)?;
            Ok(None)
        }
    }
}

fn write_atomic(path: &Path, batch: &TestBatch) -> Result<()> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    let content = serde_json::to_vec(batch)?;

    fs::write(&temp_path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
