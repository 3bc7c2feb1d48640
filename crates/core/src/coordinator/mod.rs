//! Merges backup-file upload progress and per-attachment media progress into one observable
//! [`ProgressRecord`].

mod subscription;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use subscription::ProgressSubscription;

use crate::Result;
use crate::jobs::{MediaInventory, TransferJobs};
use crate::progress::{BackupPhase, ExportProgressListener, ProgressRecord, UploadState};
use crate::store::{
    ARCHIVE_UPLOAD_STATE_KEY, FINISHED_INITIAL_BACKUP_KEY, KeyValueStore,
    UPLOAD_BANNER_VISIBLE_KEY, get_flag, get_json, put_flag, put_json,
};
use crate::tracker::{AttachmentId, AttachmentProgressTracker};

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub throttle_interval: Duration,
    pub cancel_poll_interval: Duration,
    /// `None` waits for as long as the job system takes.
    pub cancel_wait_timeout: Option<Duration>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            cancel_poll_interval: DEFAULT_CANCEL_POLL_INTERVAL,
            cancel_wait_timeout: None,
        }
    }
}

pub struct CoordinatorDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub media: Arc<dyn MediaInventory>,
    pub jobs: Arc<dyn TransferJobs>,
    pub settings: CoordinatorSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job system reported every transfer queue empty.
    Confirmed,
    TimedOut,
}

enum Completion {
    MediaDisabled,
    NothingPending,
}

struct Inner {
    state: Mutex<ProgressRecord>,
    tracker: AttachmentProgressTracker,
    notify: watch::Sender<u64>,
    store: Arc<dyn KeyValueStore>,
    media: Arc<dyn MediaInventory>,
    jobs: Arc<dyn TransferJobs>,
    settings: CoordinatorSettings,
}

/// Long-lived service shared by the exporter, upload workers, and observers. Clones share state.
#[derive(Clone)]
pub struct UploadProgressCoordinator {
    inner: Arc<Inner>,
}

impl UploadProgressCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let initial = match get_json::<ProgressRecord>(deps.store.as_ref(), ARCHIVE_UPLOAD_STATE_KEY)
        {
            Ok(Some(record)) => record,
            Ok(None) => ProgressRecord::default(),
            Err(e) => {
                warn!(
                    event = "upload.state_load_failed",
                    error = %e,
                    "upload.state_load_failed"
                );
                ProgressRecord::default()
            }
        };
        debug!(event = "upload.state_loaded", state = initial.state.as_str(), "upload.state_loaded");

        let (notify, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(initial),
                tracker: AttachmentProgressTracker::new(),
                notify,
                store: deps.store,
                media: deps.media,
                jobs: deps.jobs,
                settings: deps.settings,
            }),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn tracker(&self) -> &AttachmentProgressTracker {
        &self.inner.tracker
    }

    /// Latest stored snapshot, without recomputing media progress.
    pub fn snapshot(&self) -> ProgressRecord {
        *self.inner.state.lock()
    }

    pub fn in_progress(&self) -> bool {
        self.snapshot().in_progress()
    }

    pub fn has_finished_initial_backup(&self) -> bool {
        self.read_flag(FINISHED_INITIAL_BACKUP_KEY)
    }

    pub fn upload_banner_visible(&self) -> bool {
        self.read_flag(UPLOAD_BANNER_VISIBLE_KEY)
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription::new(self.clone(), self.inner.notify.subscribe())
    }

    /// Recomputes media progress now, then wakes every subscriber. Completion does not wait for
    /// a subscriber to poll.
    pub fn refresh(&self) -> ProgressRecord {
        let record = self.poll();
        self.notify();
        record
    }

    pub fn begin(&self, override_cancel: bool) {
        let changed = self.update(true, override_cancel, |_| {
            ProgressRecord::with_state(UploadState::Export)
        });
        let started = self.snapshot().state != UploadState::UserCanceled;
        if started && !self.has_finished_initial_backup() {
            self.write_flag(UPLOAD_BANNER_VISIBLE_KEY, true);
        }
        info!(event = "upload.begin", override_cancel, changed, started, "upload.begin");
    }

    /// Sticky until the next `begin(true)`. Transfers are interrupted asynchronously by the job system.
    pub fn cancel(&self) {
        self.write_flag(UPLOAD_BANNER_VISIBLE_KEY, false);
        self.update(true, false, |_| ProgressRecord::with_state(UploadState::UserCanceled));
        self.inner.jobs.cancel_all_transfers();
        info!(event = "upload.canceled", "upload.canceled");
    }

    /// Cancels, then polls until the job system reports its transfer queues drained.
    ///
    /// Blocks on the job system between polls; run it on a worker, never a UI-facing task.
    pub async fn cancel_and_wait(&self) -> CancelOutcome {
        self.cancel();

        let jobs = self.inner.jobs.clone();
        debug!(event = "upload.cancel_wait.flush", "upload.cancel_wait.flush");
        jobs.flush();

        let poll_interval = self.inner.settings.cancel_poll_interval;
        let wait = async {
            while !jobs.are_transfer_queues_empty() {
                tokio::time::sleep(poll_interval).await;
            }
        };

        let outcome = match self.inner.settings.cancel_wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(()) => CancelOutcome::Confirmed,
                Err(_) => CancelOutcome::TimedOut,
            },
            None => {
                wait.await;
                CancelOutcome::Confirmed
            }
        };
        match outcome {
            CancelOutcome::Confirmed => {
                info!(event = "upload.cancel_wait.confirmed", "upload.cancel_wait.confirmed")
            }
            CancelOutcome::TimedOut => {
                warn!(event = "upload.cancel_wait.timed_out", "upload.cancel_wait.timed_out")
            }
        }
        outcome
    }

    pub fn on_message_backup_created(&self, backup_file_size: u64) {
        self.update(true, false, |r| ProgressRecord {
            state: UploadState::UploadBackupFile,
            backup_file_total_bytes: backup_file_size,
            backup_file_uploaded_bytes: 0,
            ..*r
        });
    }

    pub fn on_message_backup_upload_progress(&self, transmitted: u64, total: u64) {
        self.update(true, false, |r| ProgressRecord {
            state: UploadState::UploadBackupFile,
            backup_file_uploaded_bytes: transmitted,
            backup_file_total_bytes: total,
            ..*r
        });
    }

    pub fn on_attachment_section_started(&self, total_attachment_bytes: u64) {
        self.inner.tracker.clear();
        self.update(true, false, |_| ProgressRecord {
            state: UploadState::UploadMedia,
            media_uploaded_bytes: 0,
            media_total_bytes: total_attachment_bytes,
            ..ProgressRecord::default()
        });
        debug!(
            event = "upload.media_started",
            total_attachment_bytes, "upload.media_started"
        );
    }

    pub fn on_attachment_started(&self, id: AttachmentId, size_bytes: u64) {
        self.inner.tracker.on_started(id, size_bytes);
        self.notify();
    }

    pub fn on_attachment_progress(&self, id: AttachmentId, bytes_uploaded: u64) {
        self.inner.tracker.on_progress(id, bytes_uploaded);
        self.notify();
    }

    pub fn on_attachment_finished(&self, id: AttachmentId) {
        self.inner.tracker.on_finished(id);
        self.notify();
    }

    /// The exporter stopped without producing a file to upload; nothing remains to wait for.
    pub fn on_message_backup_finished_early(&self) {
        self.update(true, false, |r| ProgressRecord {
            state: UploadState::None,
            phase: None,
            ..*r
        });
        self.write_flag(FINISHED_INITIAL_BACKUP_KEY, true);
        info!(event = "upload.finished_early", "upload.finished_early");
    }

    /// Falls back to the media section when attachment uploads are still queued, otherwise idles.
    pub fn on_main_backup_file_upload_failure(&self) {
        let revert_to_media =
            self.inner.media.backs_up_media() && self.inner.jobs.has_pending_attachment_uploads();
        info!(
            event = "upload.backup_file_failed",
            revert_to_media, "upload.backup_file_failed"
        );
        if revert_to_media {
            self.on_attachment_section_started(self.inner.media.pending_upload_bytes());
        } else {
            self.update(true, false, |r| ProgressRecord {
                state: UploadState::None,
                phase: None,
                ..*r
            });
        }
    }

    /// Recomputes media progress from the inventory and tracker, finishing the pass when nothing
    /// is pending. Other states pass through untouched.
    pub fn poll(&self) -> ProgressRecord {
        let observed = self.snapshot();
        if observed.state != UploadState::UploadMedia {
            return observed;
        }

        let (next, completion) = if !self.inner.media.backs_up_media() {
            let next = ProgressRecord {
                state: UploadState::None,
                phase: None,
                ..observed
            };
            (next, Some(Completion::MediaDisabled))
        } else {
            let inventory = self.inner.media.pending_upload_bytes();
            let in_flight = self.inner.tracker.total_uploaded_bytes();
            let pending = inventory.saturating_sub(in_flight);
            if pending == 0 {
                let next = ProgressRecord {
                    state: UploadState::None,
                    phase: None,
                    media_uploaded_bytes: observed.media_total_bytes,
                    ..observed
                };
                (next, Some(Completion::NothingPending))
            } else {
                // Newly discovered attachments can only grow the denominator.
                let total = observed
                    .media_total_bytes
                    .max(observed.media_uploaded_bytes.saturating_add(pending));
                let next = ProgressRecord {
                    state: UploadState::UploadMedia,
                    media_uploaded_bytes: total - pending,
                    media_total_bytes: total,
                    ..observed
                };
                (next, None)
            }
        };

        let applied = {
            let mut guard = self.inner.state.lock();
            if *guard != observed {
                return *guard;
            }
            if next != observed {
                *guard = next;
                self.persist(&next);
            }
            next
        };

        if let Some(completion) = completion {
            self.complete(completion, &observed);
            self.notify();
        }
        applied
    }

    fn complete(&self, completion: Completion, observed: &ProgressRecord) {
        match completion {
            Completion::MediaDisabled => {
                info!(event = "upload.media_skipped", "upload.media_skipped");
            }
            Completion::NothingPending => {
                let stats = self.inner.tracker.debug_stats();
                info!(
                    event = "upload.media_finished",
                    media_total_bytes = observed.media_total_bytes,
                    "upload.media_finished"
                );
                debug!(
                    event = "upload.media_stats",
                    attachments = stats.attachments,
                    total_bytes = stats.total_bytes,
                    bytes_per_second = stats.bytes_per_second(),
                    "upload.media_stats"
                );
                if observed.media_total_bytes > 0 {
                    self.enqueue_follow_up_pass();
                }
            }
        }
        self.write_flag(FINISHED_INITIAL_BACKUP_KEY, true);
    }

    /// A pass enqueued while a `cancel()` races in is always followed by `cancel_all_transfers`.
    fn enqueue_follow_up_pass(&self) {
        if self.snapshot().state == UploadState::UserCanceled {
            info!(event = "upload.follow_up_backup_skipped", "upload.follow_up_backup_skipped");
            return;
        }
        self.inner.jobs.enqueue_backup_pass();
        if self.snapshot().state == UploadState::UserCanceled {
            self.inner.jobs.cancel_all_transfers();
            info!(
                event = "upload.follow_up_backup_canceled",
                "upload.follow_up_backup_canceled"
            );
            return;
        }
        info!(
            event = "upload.follow_up_backup_enqueued",
            "upload.follow_up_backup_enqueued"
        );
    }

    /// Guarded read-compute-write. Returns whether the stored value changed.
    fn update(
        &self,
        notify: bool,
        override_cancel: bool,
        transform: impl FnOnce(&ProgressRecord) -> ProgressRecord,
    ) -> bool {
        {
            let mut guard = self.inner.state.lock();
            let mut next = transform(&guard);
            if guard.state == UploadState::UserCanceled && !override_cancel {
                next.state = UploadState::UserCanceled;
            }
            if next == *guard {
                return false;
            }
            *guard = next;
            self.persist(&next);
        }
        if notify {
            self.notify();
        }
        true
    }

    fn persist(&self, record: &ProgressRecord) {
        if let Err(e) = put_json(self.inner.store.as_ref(), ARCHIVE_UPLOAD_STATE_KEY, record) {
            warn!(event = "upload.persist_failed", error = %e, "upload.persist_failed");
        }
    }

    fn notify(&self) {
        self.inner.notify.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn read_flag(&self, key: &str) -> bool {
        get_flag(self.inner.store.as_ref(), key).unwrap_or_else(|e| {
            warn!(event = "upload.flag_read_failed", key, error = %e, "upload.flag_read_failed");
            false
        })
    }

    fn write_flag(&self, key: &str, value: bool) {
        if let Err(e) = put_flag(self.inner.store.as_ref(), key, value) {
            warn!(event = "upload.flag_write_failed", key, error = %e, "upload.flag_write_failed");
        }
    }

    fn set_phase(&self, phase: Option<BackupPhase>, exported: u64, total: u64) {
        self.update(true, false, |_| ProgressRecord {
            state: UploadState::Export,
            phase,
            frame_export_count: exported,
            frame_export_total: total,
            ..ProgressRecord::default()
        });
    }
}

impl ExportProgressListener for UploadProgressCoordinator {
    fn on_account(&self) {
        self.set_phase(Some(BackupPhase::Account), 0, 0);
    }

    fn on_recipient(&self) {
        self.set_phase(Some(BackupPhase::Recipient), 0, 0);
    }

    fn on_thread(&self) {
        self.set_phase(Some(BackupPhase::Thread), 0, 0);
    }

    fn on_call(&self) {
        self.set_phase(Some(BackupPhase::Call), 0, 0);
    }

    fn on_sticker(&self) {
        self.set_phase(Some(BackupPhase::Sticker), 0, 0);
    }

    fn on_notification_profile(&self) {
        self.set_phase(Some(BackupPhase::NotificationProfile), 0, 0);
    }

    fn on_chat_folder(&self) {
        self.set_phase(Some(BackupPhase::ChatFolder), 0, 0);
    }

    fn on_message(&self, current: u64, approximate_total: u64) {
        self.set_phase(Some(BackupPhase::Message), current, approximate_total);
    }

    fn on_attachment(&self, _current: u64, _total: u64) {
        self.set_phase(None, 0, 0);
    }
}

/// Reads the persisted record without constructing a coordinator.
pub fn load_progress_record(store: &dyn KeyValueStore) -> Result<ProgressRecord> {
    Ok(get_json(store, ARCHIVE_UPLOAD_STATE_KEY)?.unwrap_or_default())
}
