use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UploadState {
    #[default]
    None,
    Export,
    UploadBackupFile,
    UploadMedia,
    UserCanceled,
}

impl UploadState {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Export => 1,
            Self::UploadBackupFile => 2,
            Self::UploadMedia => 3,
            Self::UserCanceled => 4,
        }
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Export,
            2 => Self::UploadBackupFile,
            3 => Self::UploadMedia,
            4 => Self::UserCanceled,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Export => "export",
            Self::UploadBackupFile => "upload_backup_file",
            Self::UploadMedia => "upload_media",
            Self::UserCanceled => "user_canceled",
        }
    }
}

/// Which data category the exporter is serializing while in [`UploadState::Export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    Account,
    Recipient,
    Thread,
    Call,
    Sticker,
    NotificationProfile,
    ChatFolder,
    Message,
}

impl BackupPhase {
    /// Zero is reserved for "no phase".
    fn ordinal(phase: Option<Self>) -> u8 {
        match phase {
            None => 0,
            Some(Self::Account) => 1,
            Some(Self::Recipient) => 2,
            Some(Self::Thread) => 3,
            Some(Self::Call) => 4,
            Some(Self::Sticker) => 5,
            Some(Self::NotificationProfile) => 6,
            Some(Self::ChatFolder) => 7,
            Some(Self::Message) => 8,
        }
    }

    fn from_ordinal(value: u8) -> Option<Option<Self>> {
        Some(match value {
            0 => None,
            1 => Some(Self::Account),
            2 => Some(Self::Recipient),
            3 => Some(Self::Thread),
            4 => Some(Self::Call),
            5 => Some(Self::Sticker),
            6 => Some(Self::NotificationProfile),
            7 => Some(Self::ChatFolder),
            8 => Some(Self::Message),
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Recipient => "recipient",
            Self::Thread => "thread",
            Self::Call => "call",
            Self::Sticker => "sticker",
            Self::NotificationProfile => "notification_profile",
            Self::ChatFolder => "chat_folder",
            Self::Message => "message",
        }
    }
}

/// Immutable snapshot of the upload pipeline's position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "PersistedProgress", try_from = "PersistedProgress")]
pub struct ProgressRecord {
    pub state: UploadState,
    pub phase: Option<BackupPhase>,
    pub backup_file_uploaded_bytes: u64,
    pub backup_file_total_bytes: u64,
    pub media_uploaded_bytes: u64,
    pub media_total_bytes: u64,
    pub frame_export_count: u64,
    pub frame_export_total: u64,
}

impl ProgressRecord {
    pub fn with_state(state: UploadState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, UploadState::None | UploadState::UserCanceled)
    }

    /// Snapshots that must reach subscribers even inside a throttle window: terminal states and
    /// the zero-byte start of each upload section.
    pub fn bypasses_throttle(&self) -> bool {
        match self.state {
            UploadState::None | UploadState::UserCanceled => true,
            UploadState::UploadBackupFile => self.backup_file_uploaded_bytes == 0,
            UploadState::UploadMedia => self.media_uploaded_bytes == 0,
            UploadState::Export => false,
        }
    }
}

/// On-disk form: enum ordinals plus counters, camelCase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedProgress {
    state: u8,
    #[serde(default)]
    backup_phase: u8,
    #[serde(default)]
    backup_file_uploaded_bytes: u64,
    #[serde(default)]
    backup_file_total_bytes: u64,
    #[serde(default)]
    media_uploaded_bytes: u64,
    #[serde(default)]
    media_total_bytes: u64,
    #[serde(default)]
    frame_export_count: u64,
    #[serde(default)]
    frame_total_count: u64,
}

impl From<ProgressRecord> for PersistedProgress {
    fn from(r: ProgressRecord) -> Self {
        Self {
            state: r.state.ordinal(),
            backup_phase: BackupPhase::ordinal(r.phase),
            backup_file_uploaded_bytes: r.backup_file_uploaded_bytes,
            backup_file_total_bytes: r.backup_file_total_bytes,
            media_uploaded_bytes: r.media_uploaded_bytes,
            media_total_bytes: r.media_total_bytes,
            frame_export_count: r.frame_export_count,
            frame_total_count: r.frame_export_total,
        }
    }
}

impl TryFrom<PersistedProgress> for ProgressRecord {
    type Error = Error;

    fn try_from(p: PersistedProgress) -> Result<Self> {
        let state = UploadState::from_ordinal(p.state).ok_or_else(|| Error::FormatMismatch {
            key: "archiveUploadState.state".to_string(),
            value: i64::from(p.state),
        })?;
        let phase = BackupPhase::from_ordinal(p.backup_phase).ok_or_else(|| Error::FormatMismatch {
            key: "archiveUploadState.backupPhase".to_string(),
            value: i64::from(p.backup_phase),
        })?;
        Ok(Self {
            state,
            phase,
            backup_file_uploaded_bytes: p.backup_file_uploaded_bytes,
            backup_file_total_bytes: p.backup_file_total_bytes,
            media_uploaded_bytes: p.media_uploaded_bytes,
            media_total_bytes: p.media_total_bytes,
            frame_export_count: p.frame_export_count,
            frame_export_total: p.frame_total_count,
        })
    }
}

/// Callbacks from the exporter as it walks each data category.
pub trait ExportProgressListener: Send + Sync {
    fn on_account(&self);
    fn on_recipient(&self);
    fn on_thread(&self);
    fn on_call(&self);
    fn on_sticker(&self);
    fn on_notification_profile(&self);
    fn on_chat_folder(&self);
    fn on_message(&self, current: u64, approximate_total: u64);
    fn on_attachment(&self, current: u64, total: u64);
}
