//! Encrypted backup stream layout:
//!
//! ```text
//! [forward secrecy metadata][IV: 16][AES-256-CBC(zstd(frame stream))][HMAC-SHA256: 32]
//! ```
//!
//! The MAC covers every byte before it. The plaintext mode used for debug exports is the bare
//! frame stream with no envelope.

mod cipher;
mod frames;
mod metadata;

use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use hmac::Mac;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use cipher::{IV_LEN, MAC_LEN};
pub use frames::{FrameReader, FrameWriter};
pub use metadata::{
    ForwardSecrecyMetadata, MAX_METADATA_BYTES, METADATA_MAGIC, METADATA_UPPER_BOUND,
    read_forward_secrecy_metadata,
};

use crate::keys::{BackupCredentials, MessageBackupKeys};
use crate::version::CURRENT_VERSION;
use crate::{Error, Result};
use cipher::{BLOCK_LEN, CbcDecryptReader, CbcEncryptWriter, MacSink, MacWriter};

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSettings {
    pub compression_level: i32,
    pub max_frame_bytes: usize,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

type EncryptedSink<W> = zstd::stream::write::Encoder<'static, CbcEncryptWriter<MacWriter<W>>>;

pub struct EncryptedBackupWriter<W: Write> {
    frames: FrameWriter<EncryptedSink<W>>,
}

impl<W: Write> EncryptedBackupWriter<W> {
    pub fn new(
        sink: W,
        keys: &MessageBackupKeys,
        metadata: &ForwardSecrecyMetadata,
        settings: &CodecSettings,
    ) -> Result<Self> {
        Self::with_format_version(sink, keys, metadata, settings, CURRENT_VERSION)
    }

    /// Writes an older (still supported) frame layout, e.g. to produce legacy fixtures.
    pub fn with_format_version(
        sink: W,
        keys: &MessageBackupKeys,
        metadata: &ForwardSecrecyMetadata,
        settings: &CodecSettings,
        version: u32,
    ) -> Result<Self> {
        let mut mac_writer = MacWriter::new(sink, cipher::new_mac(&keys.mac_key)?);
        metadata.write_to(&mut mac_writer)?;

        let iv = cipher::random_iv()?;
        mac_writer.write_all(&iv)?;

        let encryptor = CbcEncryptWriter::new(mac_writer, &keys.cipher_key, &iv);
        let compressor = zstd::stream::write::Encoder::new(encryptor, settings.compression_level)?;
        let frames = FrameWriter::new(compressor, version, settings.max_frame_bytes)?;
        Ok(Self { frames })
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.frames.write_frame(frame)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames.frames_written()
    }

    pub fn finish(self) -> Result<W> {
        let frames_written = self.frames.frames_written();
        let encryptor = self.frames.into_inner().finish()?;
        let sink = encryptor.finish()?.finish()?;
        debug!(event = "codec.encode.finish", frames_written, "codec.encode.finish");
        Ok(sink)
    }
}

/// Debug export: the frame stream written as-is.
pub struct PlaintextBackupWriter<W: Write> {
    frames: FrameWriter<W>,
}

impl<W: Write> PlaintextBackupWriter<W> {
    pub fn new(sink: W, settings: &CodecSettings) -> Result<Self> {
        Ok(Self {
            frames: FrameWriter::new(sink, CURRENT_VERSION, settings.max_frame_bytes)?,
        })
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.frames.write_frame(frame)
    }

    pub fn finish(self) -> Result<W> {
        let mut sink = self.frames.into_inner();
        sink.flush()?;
        Ok(sink)
    }
}

pub fn encode_frames<I, F>(
    frames: I,
    keys: &MessageBackupKeys,
    metadata: &ForwardSecrecyMetadata,
    settings: &CodecSettings,
) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut writer = EncryptedBackupWriter::new(Vec::new(), keys, metadata, settings)?;
    for frame in frames {
        writer.write_frame(frame.as_ref())?;
    }
    writer.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLayout {
    pub metadata: ForwardSecrecyMetadata,
    pub metadata_len: u64,
    /// IV plus encrypted body.
    pub ciphertext_len: u64,
    pub total_len: u64,
}

/// Parses the leading metadata and checks the stream is long enough to hold it and the MAC.
/// Leaves the stream position unspecified.
pub fn inspect_encrypted<S: Read + Seek>(source: &mut S) -> Result<BackupLayout> {
    let total_len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;

    let metadata = read_forward_secrecy_metadata(source)?;
    let metadata_len = source.stream_position()?;

    let ciphertext_len = total_len
        .checked_sub(MAC_LEN as u64)
        .and_then(|n| n.checked_sub(metadata_len))
        .ok_or_else(|| {
            Error::truncated(format!(
                "stream is {total_len} bytes, needs at least {} for metadata and mac",
                metadata_len + MAC_LEN as u64
            ))
        })?;

    Ok(BackupLayout {
        metadata,
        metadata_len,
        ciphertext_len,
        total_len,
    })
}

fn verify_mac<S: Read + Seek>(
    source: &mut S,
    keys: &MessageBackupKeys,
    total_len: u64,
) -> Result<()> {
    let authenticated_len = total_len - MAC_LEN as u64;
    source.seek(SeekFrom::Start(0))?;

    let mut mac = cipher::new_mac(&keys.mac_key)?;
    let copied = io::copy(&mut source.by_ref().take(authenticated_len), &mut MacSink(&mut mac))?;
    if copied != authenticated_len {
        return Err(Error::truncated(format!(
            "stream shrank while reading: {copied} of {authenticated_len} bytes"
        )));
    }

    let mut tag = [0u8; MAC_LEN];
    source
        .read_exact(&mut tag)
        .map_err(Error::from_stream_read)?;

    mac.verify_slice(&tag).map_err(|_| {
        warn!(event = "codec.decode.mac_mismatch", total_len, "codec.decode.mac_mismatch");
        Error::MacMismatch
    })
}

/// Verifies the MAC over the whole stream, then returns a pull-based reader that decrypts and
/// decompresses on demand.
pub fn decode_encrypted<'a, S: Read + Seek + 'a>(
    mut source: S,
    keys: &MessageBackupKeys,
    settings: &CodecSettings,
) -> Result<FrameReader<'a>> {
    let layout = inspect_encrypted(&mut source)?;
    verify_mac(&mut source, keys, layout.total_len)?;

    if layout.ciphertext_len == 0 {
        debug!(event = "codec.decode.empty", "codec.decode.empty");
        return Ok(FrameReader::empty(settings.max_frame_bytes));
    }
    if layout.ciphertext_len < IV_LEN as u64 {
        return Err(Error::truncated(format!(
            "ciphertext of {} bytes cannot hold the iv",
            layout.ciphertext_len
        )));
    }
    let body_len = layout.ciphertext_len - IV_LEN as u64;
    if body_len == 0 || body_len % BLOCK_LEN as u64 != 0 {
        return Err(Error::corrupt(format!(
            "ciphertext body of {body_len} bytes is not whole blocks"
        )));
    }

    source.seek(SeekFrom::Start(layout.metadata_len))?;
    let mut iv = [0u8; IV_LEN];
    source
        .read_exact(&mut iv)
        .map_err(Error::from_stream_read)?;

    let decryptor = CbcDecryptReader::new(source.take(body_len), &keys.cipher_key, &iv);
    let decompressor = zstd::stream::read::Decoder::new(decryptor)?;
    let reader = FrameReader::open(Box::new(decompressor), settings.max_frame_bytes)?;
    debug!(
        event = "codec.decode.open",
        version = reader.version(),
        ciphertext_len = layout.ciphertext_len,
        "codec.decode.open"
    );
    Ok(reader)
}

pub fn decode_plaintext<'a, R: Read + 'a>(
    reader: R,
    settings: &CodecSettings,
) -> Result<FrameReader<'a>> {
    FrameReader::open(Box::new(BufReader::new(reader)), settings.max_frame_bytes)
}

/// Restore-side boundary: `None` credentials means the stream is a plaintext debug export.
pub fn open_backup<'a, S: Read + Seek + 'a>(
    source: S,
    credentials: Option<&BackupCredentials>,
    settings: &CodecSettings,
) -> Result<FrameReader<'a>> {
    match credentials {
        Some(credentials) => {
            let keys = credentials.derive_keys()?;
            decode_encrypted(source, &keys, settings)
        }
        None => decode_plaintext(source, settings),
    }
}
