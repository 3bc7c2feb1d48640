use std::io::{self, Read, Write};

use super::frames::{Varint, read_full, read_varint, varint_len, write_varint};
use crate::{Error, Result};

const MAGIC_LEN: usize = 8;
pub const METADATA_MAGIC: &[u8; MAGIC_LEN] = b"MSGBAKFS";
pub const MAX_METADATA_BYTES: usize = 2048;
const MAX_LENGTH_VARINT_BYTES: usize = 5;

/// Enough leading bytes to always contain a well-formed metadata block.
pub const METADATA_UPPER_BOUND: usize =
    MAGIC_LEN + MAX_LENGTH_VARINT_BYTES + MAX_METADATA_BYTES;

/// Opaque bytes produced by the forward-secrecy exchange, stored in the clear at the head of
/// an encrypted backup so a restoring device can run the exchange before decrypting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSecrecyMetadata {
    bytes: Vec<u8>,
}

impl ForwardSecrecyMetadata {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > MAX_METADATA_BYTES {
            return Err(Error::MalformedForwardSecrecyMetadata {
                message: format!(
                    "metadata length must be 1..={MAX_METADATA_BYTES} (got {})",
                    bytes.len()
                ),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the whole block on the wire, magic and length prefix included.
    pub fn encoded_len(&self) -> usize {
        MAGIC_LEN + varint_len(self.bytes.len() as u64) + self.bytes.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(METADATA_MAGIC)?;
        write_varint(w, self.bytes.len() as u64)?;
        w.write_all(&self.bytes)
    }
}

pub fn read_forward_secrecy_metadata<R: Read>(reader: &mut R) -> Result<ForwardSecrecyMetadata> {
    let mut magic = [0u8; MAGIC_LEN];
    let n = read_full(reader, &mut magic)?;
    if n < magic.len() {
        return Err(Error::truncated(format!(
            "stream ended inside metadata magic ({n} bytes)"
        )));
    }
    if &magic != METADATA_MAGIC {
        return Err(Error::MissingForwardSecrecyMetadata);
    }

    let len = match read_varint(reader, MAX_LENGTH_VARINT_BYTES) {
        Ok(Varint::Value(v)) => v,
        Ok(Varint::Eof) => return Err(Error::truncated("stream ended before metadata length")),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(Error::truncated("stream ended inside metadata length"));
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(Error::MalformedForwardSecrecyMetadata {
                message: e.to_string(),
            });
        }
        Err(e) => return Err(Error::Io(e)),
    };
    if len == 0 || len > MAX_METADATA_BYTES as u64 {
        return Err(Error::MalformedForwardSecrecyMetadata {
            message: format!("metadata length out of range: {len}"),
        });
    }

    let mut bytes = vec![0u8; len as usize];
    let n = read_full(reader, &mut bytes)?;
    if n < bytes.len() {
        return Err(Error::truncated(format!(
            "stream ended inside metadata ({n} of {len} bytes)"
        )));
    }
    Ok(ForwardSecrecyMetadata { bytes })
}
