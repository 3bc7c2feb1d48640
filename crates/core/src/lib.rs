pub mod codec;
pub mod config;
pub mod coordinator;
mod error;
pub mod jobs;
pub mod keys;
pub mod progress;
pub mod restore_phase;
pub mod run_log;
pub mod store;
pub mod tracker;
pub mod version;

pub const APP_NAME: &str = "MsgBackup";

pub use codec::{
    BackupLayout, CodecSettings, EncryptedBackupWriter, FrameReader, PlaintextBackupWriter,
    decode_encrypted, decode_plaintext, encode_frames, inspect_encrypted, open_backup,
};
pub use coordinator::{
    CancelOutcome, CoordinatorDeps, CoordinatorSettings, ProgressSubscription,
    UploadProgressCoordinator,
};
pub use error::{Error, ErrorKind, Result};
pub use keys::{AccountId, BackupCredentials, BackupKey, ForwardSecrecyToken, MessageBackupKeys};
pub use progress::{BackupPhase, ExportProgressListener, ProgressRecord, UploadState};
pub use restore_phase::{RestorePhase, load_restore_phase, save_restore_phase};
pub use tracker::{AttachmentId, AttachmentProgressTracker};
