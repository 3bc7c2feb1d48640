use std::io::{self, Read, Write};

use crate::version::{ensure_compatible, frame_lengths_encrypted};
use crate::{Error, Result};

const VERSION_HEADER_BYTES: usize = 4;
const LEGACY_LENGTH_PREFIX_BYTES: usize = 4;
const MAX_VARINT_BYTES: usize = 10;

pub(super) enum Varint {
    Value(u64),
    Eof,
}

pub(super) fn write_varint<W: Write>(w: &mut W, mut value: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n])?;
    Ok(n)
}

pub(super) fn varint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Clean EOF before the first byte is `Varint::Eof`; EOF mid-value is `UnexpectedEof`.
/// Only the minimal encoding of a value is accepted.
pub(super) fn read_varint<R: Read + ?Sized>(r: &mut R, max_bytes: usize) -> io::Result<Varint> {
    let mut value = 0u64;
    for i in 0..max_bytes {
        let mut byte = [0u8; 1];
        if read_full(r, &mut byte)? == 0 {
            if i == 0 {
                return Ok(Varint::Eof);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            if byte[0] == 0 && i > 0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "non-minimal varint"));
            }
            return Ok(Varint::Value(value));
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}

/// Reads until `buf` is full or the source is exhausted.
pub(super) fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes the plaintext frame stream: a big-endian version header, then length-prefixed frames.
pub struct FrameWriter<W: Write> {
    inner: W,
    version: u32,
    max_frame_bytes: usize,
    frames_written: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(mut inner: W, version: u32, max_frame_bytes: usize) -> Result<Self> {
        ensure_compatible(version)?;
        inner.write_all(&version.to_be_bytes())?;
        Ok(Self {
            inner,
            version,
            max_frame_bytes,
            frames_written: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_bytes {
            return Err(Error::InvalidConfig {
                message: format!(
                    "frame too large: {} bytes (max_frame_bytes={})",
                    frame.len(),
                    self.max_frame_bytes
                ),
            });
        }

        if frame_lengths_encrypted(self.version) {
            write_varint(&mut self.inner, frame.len() as u64)?;
        } else {
            let len = u32::try_from(frame.len()).map_err(|_| Error::InvalidConfig {
                message: "frame too large for legacy length prefix".to_string(),
            })?;
            self.inner.write_all(&len.to_be_bytes())?;
        }
        self.inner.write_all(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Pull-based reader over a plaintext frame stream.
pub struct FrameReader<'a> {
    inner: Option<Box<dyn Read + 'a>>,
    version: Option<u32>,
    max_frame_bytes: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn open(mut inner: Box<dyn Read + 'a>, max_frame_bytes: usize) -> Result<Self> {
        let mut header = [0u8; VERSION_HEADER_BYTES];
        let n = read_full(inner.as_mut(), &mut header).map_err(Error::from_stream_read)?;
        if n < VERSION_HEADER_BYTES {
            return Err(Error::truncated(format!(
                "frame stream version header: got {n} of {VERSION_HEADER_BYTES} bytes"
            )));
        }
        let version = u32::from_be_bytes(header);
        ensure_compatible(version)?;

        Ok(Self {
            inner: Some(inner),
            version: Some(version),
            max_frame_bytes,
        })
    }

    /// A stream that carried no ciphertext at all.
    pub(crate) fn empty(max_frame_bytes: usize) -> Self {
        Self {
            inner: None,
            version: None,
            max_frame_bytes,
        }
    }

    /// `None` when the stream carried no ciphertext.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let (Some(inner), Some(version)) = (self.inner.as_mut(), self.version) else {
            return Ok(None);
        };

        let len = if frame_lengths_encrypted(version) {
            match read_varint(inner.as_mut(), MAX_VARINT_BYTES).map_err(Error::from_stream_read)? {
                Varint::Value(v) => v,
                Varint::Eof => {
                    self.inner = None;
                    return Ok(None);
                }
            }
        } else {
            let mut prefix = [0u8; LEGACY_LENGTH_PREFIX_BYTES];
            match read_full(inner.as_mut(), &mut prefix).map_err(Error::from_stream_read)? {
                0 => {
                    self.inner = None;
                    return Ok(None);
                }
                LEGACY_LENGTH_PREFIX_BYTES => u64::from(u32::from_be_bytes(prefix)),
                n => {
                    return Err(Error::truncated(format!(
                        "frame length prefix: got {n} of {LEGACY_LENGTH_PREFIX_BYTES} bytes"
                    )));
                }
            }
        };

        if len > self.max_frame_bytes as u64 {
            return Err(Error::corrupt(format!(
                "frame length {len} exceeds max_frame_bytes={}",
                self.max_frame_bytes
            )));
        }

        let mut frame = vec![0u8; len as usize];
        inner
            .read_exact(&mut frame)
            .map_err(Error::from_stream_read)?;
        Ok(Some(frame))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.inner = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::CURRENT_VERSION;

    fn write_stream(version: u32, frames: &[&[u8]]) -> Vec<u8> {
        let mut w = FrameWriter::new(Vec::new(), version, 1024).unwrap();
        for f in frames {
            w.write_frame(f).unwrap();
        }
        w.into_inner()
    }

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            let n = write_varint(&mut buf, v).unwrap();
            assert_eq!(n, varint_len(v));
            match read_varint(&mut buf.as_slice(), MAX_VARINT_BYTES).unwrap() {
                Varint::Value(got) => assert_eq!(got, v),
                Varint::Eof => panic!("unexpected eof"),
            }
        }
    }

    #[test]
    fn non_minimal_varint_is_invalid_data() {
        for bytes in [&[0x80, 0x00][..], &[0x81, 0x80, 0x00][..]] {
            let err = read_varint(&mut &bytes[..], MAX_VARINT_BYTES).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
        assert!(matches!(
            read_varint(&mut &[0x00][..], MAX_VARINT_BYTES),
            Ok(Varint::Value(0))
        ));
    }

    #[test]
    fn legacy_and_current_framing_differ() {
        let legacy = write_stream(1, &[b"abc"]);
        let current = write_stream(CURRENT_VERSION, &[b"abc"]);
        assert_eq!(&legacy[4..8], &3u32.to_be_bytes());
        assert_eq!(current[4], 3);
        assert_eq!(legacy.len(), current.len() + 3);

        for bytes in [legacy, current] {
            let reader = FrameReader::open(Box::new(std::io::Cursor::new(bytes)), 1024).unwrap();
            let frames: Vec<Vec<u8>> = reader.map(|f| f.unwrap()).collect();
            assert_eq!(frames, vec![b"abc".to_vec()]);
        }
    }

    #[test]
    fn unsupported_version_header_is_rejected() {
        let mut bytes = write_stream(CURRENT_VERSION, &[]);
        bytes[..4].copy_from_slice(&(CURRENT_VERSION + 1).to_be_bytes());
        let err = FrameReader::open(Box::new(std::io::Cursor::new(bytes)), 1024)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedVersion { version, .. } if version == CURRENT_VERSION + 1));
    }

    #[test]
    fn truncated_frame_body_is_truncation() {
        let mut bytes = write_stream(CURRENT_VERSION, &[b"hello"]);
        bytes.pop();
        let mut reader =
            FrameReader::open(Box::new(std::io::Cursor::new(bytes)), 1024).unwrap();
        assert!(matches!(reader.next_frame(), Err(Error::Truncated { .. })));
    }

    #[test]
    fn oversize_frame_is_corrupt() {
        let bytes = write_stream(CURRENT_VERSION, &[&[0u8; 100]]);
        let mut reader = FrameReader::open(Box::new(std::io::Cursor::new(bytes)), 10).unwrap();
        assert!(matches!(reader.next_frame(), Err(Error::Corrupt { .. })));
    }
}
