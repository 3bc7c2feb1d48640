pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup stream truncated: {message}")]
    Truncated { message: String },

    #[error("backup mac mismatch")]
    MacMismatch,

    #[error("forward secrecy metadata missing")]
    MissingForwardSecrecyMetadata,

    #[error("forward secrecy metadata malformed: {message}")]
    MalformedForwardSecrecyMetadata { message: String },

    #[error("backup stream corrupt: {message}")]
    Corrupt { message: String },

    #[error("unsupported backup version: {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },

    #[error("crypto error")]
    Crypto,

    #[error("key-value store error: {message}")]
    Store { message: String },

    #[error("unrecognized persisted value for {key}: {value}")]
    FormatMismatch { key: String, value: i64 },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Integrity,
    Truncated,
    Format,
    Config,
    Storage,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MacMismatch
            | Self::MissingForwardSecrecyMetadata
            | Self::MalformedForwardSecrecyMetadata { .. }
            | Self::Corrupt { .. }
            | Self::Crypto => ErrorKind::Integrity,
            Self::Truncated { .. } => ErrorKind::Truncated,
            Self::UnsupportedVersion { .. } | Self::FormatMismatch { .. } => ErrorKind::Format,
            Self::InvalidConfig { .. } => ErrorKind::Config,
            Self::Store { .. } | Self::Json(_) => ErrorKind::Storage,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// The single message shown for a terminal restore failure, if this is one.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedVersion { version, max, .. } if version > max => Some(
                "This backup was made by a newer version of the app. Update the app to restore it.",
            ),
            Self::UnsupportedVersion { .. } => {
                Some("This backup predates the oldest supported backup format and cannot be restored.")
            }
            _ => match self.kind() {
                ErrorKind::Integrity | ErrorKind::Truncated => Some("Could not read backup."),
                _ => None,
            },
        }
    }

    pub(crate) fn truncated(message: impl Into<String>) -> Self {
        Self::Truncated {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Classifies an I/O failure raised while pulling bytes out of a backup stream.
    pub(crate) fn from_stream_read(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::truncated(e.to_string()),
            std::io::ErrorKind::InvalidData => Self::corrupt(e.to_string()),
            _ => Self::Io(e),
        }
    }
}
