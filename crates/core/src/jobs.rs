use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Aggregate view over the attachment table.
pub trait MediaInventory: Send + Sync {
    /// Bytes of attachments still waiting for an archive upload.
    fn pending_upload_bytes(&self) -> u64;
    fn backs_up_media(&self) -> bool;
}

/// Handle onto the job system that performs the actual transfers.
pub trait TransferJobs: Send + Sync {
    /// Requests cancellation of the backup job and every archive transfer queue. Must not block.
    fn cancel_all_transfers(&self);
    fn flush(&self);
    fn are_transfer_queues_empty(&self) -> bool;
    fn has_pending_attachment_uploads(&self) -> bool;
    fn enqueue_backup_pass(&self);
}

#[derive(Debug)]
pub struct InMemoryMediaInventory {
    pending_bytes: AtomicU64,
    backs_up_media: AtomicBool,
}

impl InMemoryMediaInventory {
    pub fn new(pending_bytes: u64, backs_up_media: bool) -> Self {
        Self {
            pending_bytes: AtomicU64::new(pending_bytes),
            backs_up_media: AtomicBool::new(backs_up_media),
        }
    }

    pub fn set_pending_bytes(&self, bytes: u64) {
        self.pending_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_backs_up_media(&self, enabled: bool) {
        self.backs_up_media.store(enabled, Ordering::SeqCst);
    }
}

impl MediaInventory for InMemoryMediaInventory {
    fn pending_upload_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    fn backs_up_media(&self) -> bool {
        self.backs_up_media.load(Ordering::SeqCst)
    }
}

/// Records calls; queues drain when told to.
#[derive(Debug)]
pub struct InMemoryTransferJobs {
    cancel_calls: AtomicU64,
    flush_calls: AtomicU64,
    backup_passes: AtomicU64,
    queues_empty: AtomicBool,
    pending_attachment_uploads: AtomicBool,
}

impl Default for InMemoryTransferJobs {
    fn default() -> Self {
        Self {
            cancel_calls: AtomicU64::new(0),
            flush_calls: AtomicU64::new(0),
            backup_passes: AtomicU64::new(0),
            queues_empty: AtomicBool::new(true),
            pending_attachment_uploads: AtomicBool::new(false),
        }
    }
}

impl InMemoryTransferJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queues_empty(&self, empty: bool) {
        self.queues_empty.store(empty, Ordering::SeqCst);
    }

    pub fn set_pending_attachment_uploads(&self, pending: bool) {
        self.pending_attachment_uploads.store(pending, Ordering::SeqCst);
    }

    pub fn cancel_calls(&self) -> u64 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> u64 {
        self.flush_calls.load(Ordering::SeqCst)
    }

    pub fn backup_passes(&self) -> u64 {
        self.backup_passes.load(Ordering::SeqCst)
    }
}

impl TransferJobs for InMemoryTransferJobs {
    fn cancel_all_transfers(&self) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self) {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn are_transfer_queues_empty(&self) -> bool {
        self.queues_empty.load(Ordering::SeqCst)
    }

    fn has_pending_attachment_uploads(&self) -> bool {
        self.pending_attachment_uploads.load(Ordering::SeqCst)
    }

    fn enqueue_backup_pass(&self) {
        self.backup_passes.fetch_add(1, Ordering::SeqCst);
    }
}
