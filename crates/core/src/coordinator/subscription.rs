use futures::Stream;
use tokio::sync::watch;
use tokio::time::Instant;

use super::UploadProgressCoordinator;
use crate::progress::ProgressRecord;

/// Throttled view of the coordinator for one observer.
///
/// The first snapshot is delivered immediately. After that at most one snapshot per throttle
/// interval, unless the latest one bypasses the throttle (see [`ProgressRecord::bypasses_throttle`]).
/// A snapshot equal to the previously delivered one is skipped.
pub struct ProgressSubscription {
    coordinator: UploadProgressCoordinator,
    rx: watch::Receiver<u64>,
    last_emit: Option<Instant>,
    last_value: Option<ProgressRecord>,
}

impl ProgressSubscription {
    pub(super) fn new(coordinator: UploadProgressCoordinator, rx: watch::Receiver<u64>) -> Self {
        Self {
            coordinator,
            rx,
            last_emit: None,
            last_value: None,
        }
    }

    /// Waits for the next snapshot. Returns `None` once the coordinator is gone.
    pub async fn next(&mut self) -> Option<ProgressRecord> {
        loop {
            if let Some(last_emit) = self.last_emit {
                self.rx.changed().await.ok()?;
                self.wait_out_throttle(last_emit).await?;
            }

            self.rx.borrow_and_update();
            let value = self.coordinator.poll();
            if self.last_value == Some(value) {
                continue;
            }
            self.last_emit = Some(Instant::now());
            self.last_value = Some(value);
            return Some(value);
        }
    }

    /// Holds back until the interval since `last_emit` has passed, releasing early if a snapshot
    /// that bypasses the throttle shows up meanwhile.
    async fn wait_out_throttle(&mut self, last_emit: Instant) -> Option<()> {
        let deadline = last_emit + self.coordinator.settings().throttle_interval;
        loop {
            if Instant::now() >= deadline || self.coordinator.snapshot().bypasses_throttle() {
                return Some(());
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Some(()),
                changed = self.rx.changed() => changed.ok()?,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressRecord> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let value = sub.next().await?;
            Some((value, sub))
        })
    }
}
