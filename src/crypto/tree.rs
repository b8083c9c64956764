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


//! Whole-archive decryption into a mirrored plaintext tree
//!
//! Entries are independent, so they are decrypted on the blocking pool with
//! a small fan-out. Every encrypted entry maps to exactly one decrypted entry
//! at the same relative path.

use crate::crypto::stream::{DecryptionOutcome, StreamCipher};
use crate::error::{LiberatorError, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Number of archive entries decrypted concurrently
const DECRYPT_FAN_OUT: usize = 4;

/// One file inside the fetched (extracted) archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFileEntry {
    /// Path relative to the archive root
    pub relative_path: PathBuf,
    pub len: u64,
}

/// One produced plaintext file and how it was produced
#[derive(Debug, Clone)]
pub struct DecryptedEntry {
    pub relative_path: PathBuf,
    pub outcome: DecryptionOutcome,
}

/// Plaintext files mirroring an encrypted archive
#[derive(Debug, Clone)]
pub struct DecryptedTree {
    root: PathBuf,
    entries: Vec<DecryptedEntry>,
}

impl DecryptedTree {
    pub fn new(root: PathBuf, entries: Vec<DecryptedEntry>) -> Self {
        Self { root, entries }
    }

    /// Wrap an already-decrypted directory (entries are not tracked)
    pub fn from_existing(root: PathBuf) -> Self {
        Self {
            root,
            entries: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[DecryptedEntry] {
        &self.entries
    }

    /// Number of entries that were copied rather than decrypted
    pub fn copied_count(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_copied()).count()
    }

    /// Whether any plaintext bytes exist under the root
    pub fn has_content(&self) -> bool {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file() && e.metadata().map(|m| m.len() > 0).unwrap_or(false))
    }
}

/// List every file under an extracted archive root, sorted by path
pub fn scan_encrypted(root: &Path) -> Result<Vec<EncryptedFileEntry>> {
    if !root.is_dir() {
        return Err(LiberatorError::FileNotFound(root.display().to_string()));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| LiberatorError::InvalidPath(format!("{}: {}", entry.path().display(), e)))?
            .to_path_buf();
        let len = entry.metadata().map_err(LiberatorError::from)?.len();
        entries.push(EncryptedFileEntry { relative_path, len });
    }

    Ok(entries)
}

/// Decrypt every file under `encrypted_root` into `decrypted_root`
pub async fn decrypt_tree(
    cipher: Arc<StreamCipher>,
    encrypted_root: &Path,
    decrypted_root: &Path,
) -> Result<DecryptedTree> {
    let entries = scan_encrypted(encrypted_root)?;
    tokio::fs::create_dir_all(decrypted_root)
        .await
        .map_err(|e| LiberatorError::file_io("create_dir", decrypted_root, e))?;

    tracing::debug!(files = entries.len(), "decrypting archive entries");

    let decrypted: Vec<DecryptedEntry> = stream::iter(entries.into_iter().map(|entry| {
        let cipher = Arc::clone(&cipher);
        let input = encrypted_root.join(&entry.relative_path);
        let output = decrypted_root.join(&entry.relative_path);
        async move {
            let outcome = tokio::task::spawn_blocking(move || {
                if let Some(parent) = output.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| LiberatorError::file_io("create_dir", parent, e))?;
                }
                cipher.decrypt_file(&input, &output)
            })
            .await??;

            if let DecryptionOutcome::CopiedVerbatim { reason, .. } = &outcome {
                tracing::info!(
                    file = %entry.relative_path.display(),
                    %reason,
                    "entry copied as plaintext"
                );
            }

            Ok::<_, LiberatorError>(DecryptedEntry {
                relative_path: entry.relative_path,
                outcome,
            })
        }
    }))
    .buffer_unordered(DECRYPT_FAN_OUT)
    .try_collect()
    .await?;

    let mut decrypted = decrypted;
    decrypted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let tree = DecryptedTree::new(decrypted_root.to_path_buf(), decrypted);
    tracing::info!(
        files = tree.entries().len(),
        copied = tree.copied_count(),
        "archive decrypted"
    );
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::FileKey;
    use crate::crypto::stream::IvScheme;
    use tempfile::TempDir;

    fn cipher() -> Arc<StreamCipher> {
        let key = FileKey::from_bytes(vec![1u8; 16]).unwrap();
        Arc::new(StreamCipher::new(key, "media", IvScheme::Sha1Digest))
    }

    #[test]
    fn test_scan_lists_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("OEBPS/images")).unwrap();
        std::fs::write(dir.path().join("mimetype"), b"x").unwrap();
        std::fs::write(dir.path().join("OEBPS/images/a.png"), b"").unwrap();

        let entries = scan_encrypted(dir.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("OEBPS/images/a.png"), PathBuf::from("mimetype")]
        );
        assert_eq!(entries[0].len, 0);
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(scan_encrypted(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_every_entry_has_a_decrypted_counterpart() {
        let enc = TempDir::new().unwrap();
        let dec = TempDir::new().unwrap();
        let cipher = cipher();

        std::fs::create_dir_all(enc.path().join("sub")).unwrap();
        std::fs::write(enc.path().join("sub/page.jpg"), cipher.encrypt_bytes(&[7u8; 32])).unwrap();
        std::fs::write(enc.path().join("plain.txt"), b"hello").unwrap();
        std::fs::write(enc.path().join("empty.bin"), b"").unwrap();

        let out = dec.path().join("tree");
        let tree = decrypt_tree(Arc::clone(&cipher), enc.path(), &out).await.unwrap();

        assert_eq!(tree.entries().len(), 3);
        assert_eq!(tree.copied_count(), 1);
        assert_eq!(std::fs::read(out.join("sub/page.jpg")).unwrap(), vec![7u8; 32]);
        assert_eq!(std::fs::read(out.join("plain.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::metadata(out.join("empty.bin")).unwrap().len(), 0);
        assert!(tree.has_content());
    }
}
