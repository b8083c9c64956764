// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Chunked AES-CBC file decryption
//!
//! # Format Details
//! - Cipher: AES (key size taken from the unwrapped file key), CBC mode
//! - IV: one per title, derived from the media key (see [`IvScheme`])
//! - No padding is removed; decrypted bytes are written as-is
//! - Files are streamed in fixed-size chunks; CBC state carries across chunks
//!
//! # Mixed archives
//! Archives contain a mix of encrypted files, plaintext files and empty
//! placeholders. Every entry produces exactly one output:
//! - empty input: empty output, cipher never touched
//! - input not block aligned: verbatim copy
//! - otherwise: decrypted bytes (verbatim copy if reading/decrypting fails)

use crate::crypto::key::{FileKey, BLOCK_SIZE};
use crate::error::{LiberatorError, Result};
use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Reference chunk size for streamed decryption (1 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How the per-title initialization vector is derived from the media key
///
/// Two incompatible derivations exist upstream. Only one matches the live
/// service, so the choice is configuration rather than code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IvScheme {
    /// First 16 bytes of SHA-1 over the media key
    #[default]
    Sha1Digest,
    /// First 16 UTF-8 bytes of the media key, zero padded if shorter
    RawMediaKey,
}

impl IvScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1Digest => "sha1_digest",
            Self::RawMediaKey => "raw_media_key",
        }
    }
}

/// Derive the per-title initialization vector
pub fn derive_iv(media_key: &str, scheme: IvScheme) -> [u8; 16] {
    let mut iv = [0u8; 16];
    match scheme {
        IvScheme::Sha1Digest => {
            let digest = Sha1::digest(media_key.as_bytes());
            iv.copy_from_slice(&digest[..16]);
        }
        IvScheme::RawMediaKey => {
            let bytes = media_key.as_bytes();
            let n = bytes.len().min(16);
            iv[..n].copy_from_slice(&bytes[..n]);
        }
    }
    iv
}

/// Result of processing one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionOutcome {
    /// Ciphertext was decrypted
    Decrypted { bytes: u64 },
    /// Entry was copied byte-for-byte (plaintext by upstream design)
    CopiedVerbatim { bytes: u64, reason: String },
    /// Zero-length entry; an empty output was written
    Empty,
}

impl DecryptionOutcome {
    pub fn is_decrypted(&self) -> bool {
        matches!(self, Self::Decrypted { .. })
    }

    pub fn is_copied(&self) -> bool {
        matches!(self, Self::CopiedVerbatim { .. })
    }
}

/// File decrypter bound to one title's key and IV
#[derive(Debug, Clone)]
pub struct StreamCipher {
    key: FileKey,
    iv: [u8; 16],
    chunk_size: usize,
}

impl StreamCipher {
    /// Create a cipher for one title
    ///
    /// The IV is computed once here and reused for every file of the title.
    pub fn new(key: FileKey, media_key: &str, scheme: IvScheme) -> Self {
        Self {
            key,
            iv: derive_iv(media_key, scheme),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the streaming chunk size (rounded up to a whole block)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        let blocks = chunk_size.div_ceil(BLOCK_SIZE).max(1);
        self.chunk_size = blocks * BLOCK_SIZE;
        self
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Decrypt `input` into `output`, falling back to a verbatim copy
    ///
    /// # Errors
    /// Only I/O failures that prevent producing *any* output (unreadable
    /// input, unwritable output) are returned. Undecryptable content is an
    /// outcome, not an error.
    pub fn decrypt_file(&self, input: &Path, output: &Path) -> Result<DecryptionOutcome> {
        let len = std::fs::metadata(input)
            .map_err(|e| LiberatorError::file_io("stat", input, e))?
            .len();

        if len == 0 {
            File::create(output).map_err(|e| LiberatorError::file_io("create", output, e))?;
            return Ok(DecryptionOutcome::Empty);
        }

        if len % BLOCK_SIZE as u64 != 0 {
            return copy_verbatim(
                input,
                output,
                format!("length {} is not a multiple of the block size", len),
            );
        }

        let attempt = (|| -> io::Result<u64> {
            let mut reader = BufReader::new(File::open(input)?);
            let mut writer = BufWriter::new(File::create(output)?);
            let written = self.decrypt_stream(&mut reader, &mut writer)?;
            writer.flush()?;
            Ok(written)
        })();

        match attempt {
            Ok(bytes) => Ok(DecryptionOutcome::Decrypted { bytes }),
            Err(e) => copy_verbatim(input, output, format!("decryption failed: {}", e)),
        }
    }

    /// Decrypt a block-aligned stream chunk by chunk
    ///
    /// Returns the number of bytes written. Fails with `InvalidData` if the
    /// stream ends on a partial block.
    pub fn decrypt_stream<R: Read, W: Write>(&self, reader: &mut R, writer: &mut W) -> io::Result<u64> {
        match self.key.len() {
            16 => self.decrypt_with::<cbc::Decryptor<Aes128>, _, _>(reader, writer),
            24 => self.decrypt_with::<cbc::Decryptor<Aes192>, _, _>(reader, writer),
            32 => self.decrypt_with::<cbc::Decryptor<Aes256>, _, _>(reader, writer),
            n => Err(invalid_key_length(n)),
        }
    }

    /// Encrypt a block-aligned stream chunk by chunk
    ///
    /// Production code never encrypts; this exists to build fixtures.
    pub fn encrypt_stream<R: Read, W: Write>(&self, reader: &mut R, writer: &mut W) -> io::Result<u64> {
        match self.key.len() {
            16 => self.encrypt_with::<cbc::Encryptor<Aes128>, _, _>(reader, writer),
            24 => self.encrypt_with::<cbc::Encryptor<Aes192>, _, _>(reader, writer),
            32 => self.encrypt_with::<cbc::Encryptor<Aes256>, _, _>(reader, writer),
            n => Err(invalid_key_length(n)),
        }
    }

    /// Encrypt an in-memory payload the way upstream archives store it
    ///
    /// Payloads that are not block aligned are stored as plaintext, which is
    /// what the decrypt fallback expects.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Vec<u8> {
        if plaintext.is_empty() || plaintext.len() % BLOCK_SIZE != 0 {
            return plaintext.to_vec();
        }

        let mut out = Vec::with_capacity(plaintext.len());
        match self.encrypt_stream(&mut &plaintext[..], &mut out) {
            Ok(_) => out,
            Err(_) => plaintext.to_vec(),
        }
    }

    fn decrypt_with<C, R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<u64>
    where
        C: KeyIvInit + BlockDecryptMut + BlockSizeUser<BlockSize = U16>,
        R: Read,
        W: Write,
    {
        let mut cipher = C::new_from_slices(self.key.as_bytes(), &self.iv)
            .map_err(|_| invalid_key_length(self.key.len()))?;

        self.process_chunks(reader, writer, |chunk| {
            for block in chunk.chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        })
    }

    fn encrypt_with<C, R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<u64>
    where
        C: KeyIvInit + BlockEncryptMut + BlockSizeUser<BlockSize = U16>,
        R: Read,
        W: Write,
    {
        let mut cipher = C::new_from_slices(self.key.as_bytes(), &self.iv)
            .map_err(|_| invalid_key_length(self.key.len()))?;

        self.process_chunks(reader, writer, |chunk| {
            for block in chunk.chunks_exact_mut(BLOCK_SIZE) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        })
    }

    /// Shared chunk loop: fill a buffer, transform whole blocks, write out
    fn process_chunks<R, W, F>(&self, reader: &mut R, writer: &mut W, mut transform: F) -> io::Result<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(&mut [u8]),
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let filled = read_full(reader, &mut buffer)?;
            if filled == 0 {
                break;
            }
            if filled % BLOCK_SIZE != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("stream ended on a partial block ({} trailing bytes)", filled % BLOCK_SIZE),
                ));
            }

            transform(&mut buffer[..filled]);
            writer.write_all(&buffer[..filled])?;
            total += filled as u64;

            if filled < buffer.len() {
                break;
            }
        }

        Ok(total)
    }
}

/// Read until the buffer is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn copy_verbatim(input: &Path, output: &Path, reason: String) -> Result<DecryptionOutcome> {
    let bytes = std::fs::copy(input, output).map_err(|e| LiberatorError::file_io("copy", input, e))?;
    Ok(DecryptionOutcome::CopiedVerbatim { bytes, reason })
}

fn invalid_key_length(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported AES key length {}", len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MEDIA_KEY: &str = "9781234567890_abc";

    fn cipher() -> StreamCipher {
        let key = FileKey::from_bytes((0u8..16).collect()).unwrap();
        StreamCipher::new(key, MEDIA_KEY, IvScheme::Sha1Digest)
    }

    #[test]
    fn test_derive_iv_sha1() {
        let digest = Sha1::digest(MEDIA_KEY.as_bytes());
        assert_eq!(derive_iv(MEDIA_KEY, IvScheme::Sha1Digest), digest[..16]);
    }

    #[test]
    fn test_derive_iv_raw_media_key() {
        assert_eq!(&derive_iv(MEDIA_KEY, IvScheme::RawMediaKey), b"9781234567890_ab");

        let short = derive_iv("abc", IvScheme::RawMediaKey);
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip_across_chunk_boundaries() {
        let cipher = cipher().with_chunk_size(32);
        let plaintext: Vec<u8> = (0..16 * 9).map(|i| (i * 7 % 251) as u8).collect();

        let encrypted = cipher.encrypt_bytes(&plaintext);
        assert_ne!(encrypted, plaintext);

        let mut decrypted = Vec::new();
        cipher.decrypt_stream(&mut &encrypted[..], &mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_chunk_size_does_not_change_output() {
        let plaintext = vec![0x5Au8; 16 * 100];
        let encrypted = cipher().encrypt_bytes(&plaintext);

        for chunk in [16, 48, 1024, 4096] {
            let mut out = Vec::new();
            cipher()
                .with_chunk_size(chunk)
                .decrypt_stream(&mut &encrypted[..], &mut out)
                .unwrap();
            assert_eq!(out, plaintext, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_round_trip_for_every_length() {
        let cipher = cipher();
        let dir = TempDir::new().unwrap();

        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000, 1024, 1040] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let input = dir.path().join(format!("in-{}", len));
            let output = dir.path().join(format!("out-{}", len));
            std::fs::write(&input, cipher.encrypt_bytes(&plaintext)).unwrap();

            cipher.decrypt_file(&input, &output).unwrap();
            assert_eq!(std::fs::read(&output).unwrap(), plaintext, "length {}", len);
        }
    }

    #[test]
    fn test_zero_length_input_writes_empty_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("empty");
        let output = dir.path().join("empty.out");
        std::fs::write(&input, b"").unwrap();

        let outcome = cipher().decrypt_file(&input, &output).unwrap();
        assert_eq!(outcome, DecryptionOutcome::Empty);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);
    }

    #[test]
    fn test_unaligned_input_is_copied_verbatim() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("mimetype");
        let output = dir.path().join("mimetype.out");
        std::fs::write(&input, b"application/epub+zip").unwrap();

        let outcome = cipher().decrypt_file(&input, &output).unwrap();
        assert!(outcome.is_copied());
        assert_eq!(std::fs::read(&output).unwrap(), b"application/epub+zip");
    }

    #[test]
    fn test_aligned_input_is_decrypted_not_copied() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("page.enc");
        let output = dir.path().join("page.jpg");
        let plaintext = vec![0xFFu8; 64];
        std::fs::write(&input, cipher().encrypt_bytes(&plaintext)).unwrap();

        let outcome = cipher().decrypt_file(&input, &output).unwrap();
        assert_eq!(outcome, DecryptionOutcome::Decrypted { bytes: 64 });
        assert_eq!(std::fs::read(&output).unwrap(), plaintext);
    }

    #[test]
    fn test_partial_block_stream_is_rejected() {
        let mut out = Vec::new();
        let result = cipher().decrypt_stream(&mut &[1u8; 20][..], &mut out);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_aes256_key() {
        let key = FileKey::from_bytes(vec![9u8; 32]).unwrap();
        let cipher = StreamCipher::new(key, MEDIA_KEY, IvScheme::RawMediaKey);
        let plaintext = vec![3u8; 48];

        let encrypted = cipher.encrypt_bytes(&plaintext);
        let mut out = Vec::new();
        cipher.decrypt_stream(&mut &encrypted[..], &mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = cipher().decrypt_file(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(matches!(result, Err(LiberatorError::FileIoError(_))));
    }
}
