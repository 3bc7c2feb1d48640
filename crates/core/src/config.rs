use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecSettings, DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_FRAME_BYTES};
use crate::coordinator::CoordinatorSettings;
use crate::store::{StoreWriteOptions, write_atomic};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub upload: Upload,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub store: Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Upload {
    pub throttle_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Codec {
    pub compression_level: i32,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    pub fsync: bool,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            throttle_interval_ms: 500,
            cancel_poll_interval_ms: 1000,
            cancel_wait_timeout_ms: None,
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self { fsync: true }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            upload: Upload::default(),
            codec: Codec::default(),
            store: Store::default(),
        }
    }
}

impl Settings {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            throttle_interval: Duration::from_millis(self.upload.throttle_interval_ms),
            cancel_poll_interval: Duration::from_millis(self.upload.cancel_poll_interval_ms),
            cancel_wait_timeout: self.upload.cancel_wait_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn codec_settings(&self) -> CodecSettings {
        CodecSettings {
            compression_level: self.codec.compression_level,
            max_frame_bytes: self.codec.max_frame_bytes,
        }
    }

    pub fn store_write_options(&self) -> StoreWriteOptions {
        StoreWriteOptions {
            fsync_file: self.store.fsync,
            fsync_dir: self.store.fsync,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;
    let path = config_path(config_dir);
    write_atomic(&path, text.as_bytes(), settings.store_write_options()).map_err(|e| {
        Error::InvalidConfig {
            message: format!("config write failed: {e}"),
        }
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.upload.throttle_interval_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.throttle_interval_ms must be > 0".to_string(),
        });
    }
    if settings.upload.cancel_poll_interval_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "upload.cancel_poll_interval_ms must be > 0".to_string(),
        });
    }
    if settings.upload.cancel_wait_timeout_ms == Some(0) {
        return Err(Error::InvalidConfig {
            message: "upload.cancel_wait_timeout_ms must be > 0 when set".to_string(),
        });
    }

    if !(1..=19).contains(&settings.codec.compression_level) {
        return Err(Error::InvalidConfig {
            message: format!(
                "codec.compression_level must be in 1..=19 (got {})",
                settings.codec.compression_level
            ),
        });
    }
    if settings.codec.max_frame_bytes == 0 {
        return Err(Error::InvalidConfig {
            message: "codec.max_frame_bytes must be > 0".to_string(),
        });
    }

    Ok(())
}
