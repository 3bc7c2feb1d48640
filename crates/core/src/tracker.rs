use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(pub u64);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentProgressEntry {
    pub item_id: AttachmentId,
    /// Unset when progress arrived before the upload was registered.
    pub start_time: Option<Instant>,
    pub total_bytes: u64,
    pub bytes_uploaded: u64,
}

impl AttachmentProgressEntry {
    fn empty(item_id: AttachmentId) -> Self {
        Self {
            item_id,
            start_time: None,
            total_bytes: 0,
            bytes_uploaded: 0,
        }
    }
}

/// Throughput figures for the current pass. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputStats {
    pub attachments: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl ThroughputStats {
    pub fn bytes_per_second(&self) -> Option<u64> {
        let secs = self.elapsed.as_secs_f64();
        if self.attachments == 0 || self.total_bytes == 0 || secs <= 0.0 {
            return None;
        }
        Some((self.total_bytes as f64 / secs) as u64)
    }
}

impl fmt::Display for ThroughputStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes_per_second() {
            Some(rate) => write!(
                f,
                "attachments={} total_bytes={} rate={} bytes/sec",
                self.attachments, self.total_bytes, rate
            ),
            None => f.write_str("insufficient data"),
        }
    }
}

#[derive(Debug)]
struct PassStats {
    started_at: Mutex<Instant>,
    attachments: AtomicU64,
    bytes: AtomicU64,
}

/// Per-attachment upload progress shared by concurrent upload workers.
///
/// Progress is last-write-wins per id. An id finished during the current pass is not recreated by
/// late callbacks until [`AttachmentProgressTracker::clear`] starts a new pass.
#[derive(Debug)]
pub struct AttachmentProgressTracker {
    entries: DashMap<AttachmentId, AttachmentProgressEntry>,
    finished: DashSet<AttachmentId>,
    stats: PassStats,
}

impl Default for AttachmentProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentProgressTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            finished: DashSet::new(),
            stats: PassStats {
                started_at: Mutex::new(Instant::now()),
                attachments: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            },
        }
    }

    /// Starts a new pass: drops every entry and resets the diagnostics.
    pub fn clear(&self) {
        self.entries.clear();
        self.finished.clear();
        *self.stats.started_at.lock() = Instant::now();
        self.stats.attachments.store(0, Ordering::Relaxed);
        self.stats.bytes.store(0, Ordering::Relaxed);
    }

    /// Returns `false` when the id already finished in this pass.
    pub fn on_started(&self, id: AttachmentId, total_bytes: u64) -> bool {
        let now = Instant::now();
        match self.entries.entry(id) {
            Entry::Occupied(mut o) => {
                let e = o.get_mut();
                e.start_time.get_or_insert(now);
                e.total_bytes = total_bytes;
                true
            }
            Entry::Vacant(v) => {
                if self.finished.contains(&id) {
                    return false;
                }
                v.insert(AttachmentProgressEntry {
                    item_id: id,
                    start_time: Some(now),
                    total_bytes,
                    bytes_uploaded: 0,
                });
                true
            }
        }
    }

    /// Overwrites the uploaded count, creating an empty entry if the start call has not landed yet.
    pub fn on_progress(&self, id: AttachmentId, bytes_uploaded: u64) -> bool {
        match self.entries.entry(id) {
            Entry::Occupied(mut o) => {
                o.get_mut().bytes_uploaded = bytes_uploaded;
                true
            }
            Entry::Vacant(v) => {
                if self.finished.contains(&id) {
                    return false;
                }
                let mut entry = AttachmentProgressEntry::empty(id);
                entry.bytes_uploaded = bytes_uploaded;
                v.insert(entry);
                true
            }
        }
    }

    pub fn on_finished(&self, id: AttachmentId) -> Option<AttachmentProgressEntry> {
        self.finished.insert(id);
        self.stats.attachments.fetch_add(1, Ordering::Relaxed);

        let (_, entry) = self.entries.remove(&id)?;
        self.stats.bytes.fetch_add(entry.total_bytes, Ordering::Relaxed);
        debug!(
            event = "tracker.attachment_finished",
            attachment_id = id.0,
            total_bytes = entry.total_bytes,
            elapsed_ms = entry.start_time.map(|t| t.elapsed().as_millis() as u64),
            "tracker.attachment_finished"
        );
        Some(entry)
    }

    /// Bytes acknowledged by in-flight uploads.
    pub fn total_uploaded_bytes(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.bytes_uploaded))
    }

    pub fn get(&self, id: AttachmentId) -> Option<AttachmentProgressEntry> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: AttachmentId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn debug_stats(&self) -> ThroughputStats {
        ThroughputStats {
            attachments: self.stats.attachments.load(Ordering::Relaxed),
            total_bytes: self.stats.bytes.load(Ordering::Relaxed),
            elapsed: self.stats.started_at.lock().elapsed(),
        }
    }
}
