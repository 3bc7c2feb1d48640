use crate::{Error, Result};

pub const MINIMUM_VERSION: u32 = 1;
pub const CURRENT_VERSION: u32 = 2;

/// First format version whose frame length prefixes live inside the encrypted body.
pub const FRAME_LENGTH_ENCRYPTION_VERSION: u32 = 2;

pub fn is_compatible(version: u32) -> bool {
    (MINIMUM_VERSION..=CURRENT_VERSION).contains(&version)
}

pub fn frame_lengths_encrypted(version: u32) -> bool {
    version >= FRAME_LENGTH_ENCRYPTION_VERSION
}

pub fn ensure_compatible(version: u32) -> Result<()> {
    if is_compatible(version) {
        return Ok(());
    }
    Err(Error::UnsupportedVersion {
        version,
        min: MINIMUM_VERSION,
        max: CURRENT_VERSION,
    })
}
