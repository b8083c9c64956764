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


//! Per-title file key unwrapping
//!
//! # Scheme
//! - Key-encryption key: first 16 bytes of SHA-1 over
//!   `"{media_key}:{patron_id}:{media_key}"`. The media key appears twice;
//!   the license service expects exactly this string.
//! - Unwrap: AES-128 ECB decryption of the license payload, then PKCS#7
//!   padding removal with full validation.
//!
//! The unwrapped key is held in memory for one item's decryption phase only
//! and is never written to disk or logged.

use crate::error::{LiberatorError, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Unwrapped symmetric key used for every file of one title
///
/// Valid lengths are the AES key sizes (16, 24 or 32 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey(Vec<u8>);

impl FileKey {
    /// Wrap raw key bytes, validating the length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(LiberatorError::KeyDerivation(format!(
                "unwrapped key has {} bytes, expected 16, 24 or 32",
                n
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey(<{} bytes>)", self.0.len())
    }
}

/// Encrypted key blob from the license endpoint, with its derivation inputs
#[derive(Clone)]
pub struct WrappedKey {
    pub media_key: String,
    pub circ_id: i64,
    pub patron_id: i64,
    bytes: Vec<u8>,
}

impl WrappedKey {
    pub fn new(media_key: &str, circ_id: i64, patron_id: i64, bytes: Vec<u8>) -> Self {
        Self {
            media_key: media_key.to_string(),
            circ_id,
            patron_id,
            bytes,
        }
    }

    /// Build from the base64 text returned by the license endpoint
    pub fn from_base64(media_key: &str, circ_id: i64, patron_id: i64, text: &str) -> Result<Self> {
        let bytes = BASE64.decode(text.trim())?;
        Ok(Self::new(media_key, circ_id, patron_id, bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Derive the key-encryption key and unwrap the file key
    pub fn unwrap_key(&self) -> Result<FileKey> {
        derive_key(&self.media_key, self.patron_id, &self.bytes)
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("media_key", &self.media_key)
            .field("circ_id", &self.circ_id)
            .field("patron_id", &self.patron_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Compute the archive-specific key-encryption key
pub fn key_encryption_key(media_key: &str, patron_id: i64) -> [u8; 16] {
    let combined = format!("{}:{}:{}", media_key, patron_id, media_key);
    let digest = Sha1::digest(combined.as_bytes());

    let mut kek = [0u8; 16];
    kek.copy_from_slice(&digest[..16]);
    kek
}

/// Unwrap a server-supplied encrypted file key
///
/// # Errors
/// - `KeyDerivation` if the blob is not block aligned, the padding is invalid
///   or the unwrapped key has an unusable length
pub fn derive_key(media_key: &str, patron_id: i64, wrapped: &[u8]) -> Result<FileKey> {
    if wrapped.is_empty() || wrapped.len() % BLOCK_SIZE != 0 {
        return Err(LiberatorError::KeyDerivation(format!(
            "wrapped key length {} is not a positive multiple of {}",
            wrapped.len(),
            BLOCK_SIZE
        )));
    }

    let kek = key_encryption_key(media_key, patron_id);
    let cipher = Aes128::new(GenericArray::from_slice(&kek));

    let mut buffer = wrapped.to_vec();
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let unpadded = strip_pkcs7(&buffer)?;
    FileKey::from_bytes(unpadded.to_vec())
}

/// Wrap a file key the way the license service does
///
/// Used to build fixtures; production code only ever unwraps.
pub fn wrap_key(media_key: &str, patron_id: i64, key: &[u8]) -> Vec<u8> {
    let kek = key_encryption_key(media_key, patron_id);
    let cipher = Aes128::new(GenericArray::from_slice(&kek));

    let pad = BLOCK_SIZE - key.len() % BLOCK_SIZE;
    let mut buffer = key.to_vec();
    buffer.extend(std::iter::repeat(pad as u8).take(pad));

    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    buffer
}

/// Remove PKCS#7 padding (pad value equals pad length, every pad byte checked)
fn strip_pkcs7(data: &[u8]) -> Result<&[u8]> {
    let pad = *data
        .last()
        .ok_or_else(|| LiberatorError::KeyDerivation("empty key block".to_string()))?
        as usize;

    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(LiberatorError::KeyDerivation(format!(
            "invalid padding length {}",
            pad
        )));
    }

    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(LiberatorError::KeyDerivation(
            "inconsistent padding bytes".to_string(),
        ));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_KEY: &str = "9781234567890_abc";
    const PATRON_ID: i64 = 123456;

    #[test]
    fn test_key_encryption_key_uses_media_key_twice() {
        let expected = Sha1::digest(b"9781234567890_abc:123456:9781234567890_abc");
        assert_eq!(key_encryption_key(MEDIA_KEY, PATRON_ID), expected[..16]);
    }

    #[test]
    fn test_unwrap_recovers_original_key() {
        let original: Vec<u8> = (0u8..16).collect();
        let wrapped = wrap_key(MEDIA_KEY, PATRON_ID, &original);
        assert_eq!(wrapped.len(), 32);

        let key = derive_key(MEDIA_KEY, PATRON_ID, &wrapped).unwrap();
        assert_eq!(key.as_bytes(), original.as_slice());
    }

    #[test]
    fn test_unwrap_from_base64_license_text() {
        let original = vec![0xAB; 32];
        let wrapped = wrap_key(MEDIA_KEY, PATRON_ID, &original);
        let text = format!("{}\n", BASE64.encode(&wrapped));

        let key = WrappedKey::from_base64(MEDIA_KEY, 77, PATRON_ID, &text)
            .unwrap()
            .unwrap_key()
            .unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(key.as_bytes(), original.as_slice());
    }

    #[test]
    fn test_wrong_patron_fails_padding_check() {
        let wrapped = wrap_key(MEDIA_KEY, PATRON_ID, &[7u8; 16]);
        // A wrong key-encryption key scrambles the final block; with
        // overwhelming probability the padding no longer validates.
        let result = derive_key(MEDIA_KEY, PATRON_ID + 1, &wrapped);
        assert!(matches!(result, Err(LiberatorError::KeyDerivation(_))));
    }

    #[test]
    fn test_unaligned_blob_rejected() {
        let result = derive_key(MEDIA_KEY, PATRON_ID, &[0u8; 15]);
        assert!(matches!(result, Err(LiberatorError::KeyDerivation(_))));
        let result = derive_key(MEDIA_KEY, PATRON_ID, &[]);
        assert!(matches!(result, Err(LiberatorError::KeyDerivation(_))));
    }

    #[test]
    fn test_strip_pkcs7() {
        let mut block = vec![1u8; 12];
        block.extend([4, 4, 4, 4]);
        assert_eq!(strip_pkcs7(&block).unwrap(), &[1u8; 12]);

        let mut bad = vec![1u8; 12];
        bad.extend([4, 4, 3, 4]);
        assert!(strip_pkcs7(&bad).is_err());

        let zero = vec![0u8; 16];
        assert!(strip_pkcs7(&zero).is_err());
    }

    #[test]
    fn test_file_key_debug_is_redacted() {
        let key = FileKey::from_bytes(vec![0x42; 16]).unwrap();
        assert_eq!(format!("{:?}", key), "FileKey(<16 bytes>)");
    }
}
