use std::io::{self, Read, Write};

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::cipher::block_padding::{Pkcs7, RawPadding};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::frames::read_full;
use crate::{Error, Result};

pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
pub(super) const BLOCK_LEN: usize = 16;

const DECRYPT_CHUNK_BLOCKS: usize = 256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
pub(super) type HmacSha256 = Hmac<Sha256>;

pub(super) fn new_mac(mac_key: &[u8; 32]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| Error::Crypto)
}

pub(super) fn random_iv() -> Result<[u8; IV_LEN]> {
    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut iv).map_err(|_| Error::Crypto)?;
    Ok(iv)
}

/// Forwards writes while feeding every written byte into the MAC; `finish` appends the tag.
pub(super) struct MacWriter<W: Write> {
    inner: W,
    mac: HmacSha256,
}

impl<W: Write> MacWriter<W> {
    pub(super) fn new(inner: W, mac: HmacSha256) -> Self {
        Self { inner, mac }
    }

    pub(super) fn finish(mut self) -> io::Result<W> {
        let tag = self.mac.finalize().into_bytes();
        self.inner.write_all(&tag)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for MacWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.mac.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write sink that only feeds the MAC.
pub(super) struct MacSink<'a>(pub(super) &'a mut HmacSha256);

impl Write for MacSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(super) struct CbcEncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl<W: Write> CbcEncryptWriter<W> {
    pub(super) fn new(inner: W, cipher_key: &[u8; 32], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner,
            cipher: Aes256CbcEnc::new(cipher_key.into(), iv.into()),
            pending: Vec::with_capacity(BLOCK_LEN * 64),
        }
    }

    fn encrypt_full_blocks(&mut self) -> io::Result<()> {
        let full = self.pending.len() / BLOCK_LEN * BLOCK_LEN;
        if full == 0 {
            return Ok(());
        }
        for block in self.pending[..full].chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.inner.write_all(&self.pending[..full])?;
        self.pending.drain(..full);
        Ok(())
    }

    /// Applies PKCS#7 padding to the tail and returns the inner writer.
    pub(super) fn finish(mut self) -> io::Result<W> {
        let tail = self.pending.len() % BLOCK_LEN;
        let last = self.pending.len() - tail;
        self.pending.resize(last + BLOCK_LEN, 0);
        Pkcs7::raw_pad(&mut self.pending[last..], tail);
        self.encrypt_full_blocks()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CbcEncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= BLOCK_LEN * 64 {
            self.encrypt_full_blocks()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encrypt_full_blocks()?;
        self.inner.flush()
    }
}

/// Streaming CBC decryption. The final block is held back until EOF so its padding can be
/// stripped; the inner reader must already be bounded to the ciphertext.
pub(super) struct CbcDecryptReader<R: Read> {
    inner: R,
    cipher: Aes256CbcDec,
    chunk: Vec<u8>,
    held: Option<[u8; BLOCK_LEN]>,
    out: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> CbcDecryptReader<R> {
    pub(super) fn new(inner: R, cipher_key: &[u8; 32], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner,
            cipher: Aes256CbcDec::new(cipher_key.into(), iv.into()),
            chunk: vec![0u8; BLOCK_LEN * DECRYPT_CHUNK_BLOCKS],
            held: None,
            out: Vec::with_capacity(BLOCK_LEN * DECRYPT_CHUNK_BLOCKS),
            pos: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.out.clear();
        self.pos = 0;

        let n = read_full(&mut self.inner, &mut self.chunk)?;
        if n % BLOCK_LEN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ciphertext is not block aligned",
            ));
        }

        for block in self.chunk[..n].chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
            let mut plain = [0u8; BLOCK_LEN];
            plain.copy_from_slice(block);
            if let Some(prev) = self.held.replace(plain) {
                self.out.extend_from_slice(&prev);
            }
        }

        if n < self.chunk.len() {
            let last = self.held.take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "ciphertext has no blocks")
            })?;
            let unpadded = Pkcs7::raw_unpad(&last)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid padding"))?;
            self.out.extend_from_slice(unpadded);
            self.done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for CbcDecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.out.len() {
            if self.done {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(plain: &[u8]) -> Vec<u8> {
        let mut w = CbcEncryptWriter::new(Vec::new(), &[4u8; 32], &[2u8; IV_LEN]);
        for piece in plain.chunks(7) {
            w.write_all(piece).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn padding_always_adds_a_block_fragment() {
        assert_eq!(encrypt(b"").len(), BLOCK_LEN);
        assert_eq!(encrypt(&[0u8; 15]).len(), BLOCK_LEN);
        assert_eq!(encrypt(&[0u8; 16]).len(), BLOCK_LEN * 2);
    }

    #[test]
    fn decrypts_across_chunk_boundaries() {
        let plain: Vec<u8> = (0..BLOCK_LEN * DECRYPT_CHUNK_BLOCKS * 2 + 5)
            .map(|i| (i % 251) as u8)
            .collect();
        let cipher = encrypt(&plain);
        let mut r = CbcDecryptReader::new(cipher.as_slice(), &[4u8; 32], &[2u8; IV_LEN]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn wrong_key_fails_padding_or_differs() {
        let cipher = encrypt(b"attack at dawn");
        let mut r = CbcDecryptReader::new(cipher.as_slice(), &[5u8; 32], &[2u8; IV_LEN]);
        let mut out = Vec::new();
        match r.read_to_end(&mut out) {
            Ok(_) => assert_ne!(out, b"attack at dawn"),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
        }
    }

    #[test]
    fn padding_matches_pkcs7() {
        let mut w = CbcEncryptWriter::new(Vec::new(), &[4u8; 32], &[2u8; IV_LEN]);
        w.write_all(&[9u8; 13]).unwrap();
        let mut block = w.finish().unwrap();
        let mut dec = Aes256CbcDec::new((&[4u8; 32]).into(), (&[2u8; IV_LEN]).into());
        dec.decrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        assert_eq!(&block[..13], &[9u8; 13]);
        assert_eq!(&block[13..], &[3u8, 3, 3]);
    }

    #[test]
    fn bad_padding_is_invalid_data() {
        let mut block = [0u8; BLOCK_LEN];
        let mut enc = Aes256CbcEnc::new((&[4u8; 32]).into(), (&[2u8; IV_LEN]).into());
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        let mut r = CbcDecryptReader::new(&block[..], &[4u8; 32], &[2u8; IV_LEN]);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn misaligned_ciphertext_is_invalid_data() {
        let mut cipher = encrypt(b"0123456789abcdef");
        cipher.pop();
        let mut r = CbcDecryptReader::new(cipher.as_slice(), &[4u8; 32], &[2u8; IV_LEN]);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
