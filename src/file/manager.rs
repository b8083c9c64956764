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


//! Scratch directories and artifact promotion
//!
//! # Key Operations
//! - Per-item scratch directory, cleared before and after each run
//! - Promotion of finished artifacts into the output root (rename, with a
//!   copy-then-rename fallback across filesystems, retried)
//! - Collision-free destination names; existing outputs are never replaced

use crate::error::{LiberatorError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

const ENCRYPTED_DIR: &str = "encrypted";
const DECRYPTED_DIR: &str = "decrypted";
const STAGING_DIR: &str = "staging";

/// Which scratch subtrees survive cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetainPolicy {
    pub keep_encrypted: bool,
    pub keep_decrypted: bool,
}

impl RetainPolicy {
    fn retains_anything(&self) -> bool {
        self.keep_encrypted || self.keep_decrypted
    }
}

/// Working directory owned by one item's run
///
/// Layout: `encrypted/` (fetched archive or stream), `decrypted/`
/// (plaintext tree), `staging/` (artifacts waiting for promotion).
#[derive(Debug)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    /// Create `<scratch_root>/<name>`, removing anything left from a
    /// previous run under the same name
    pub async fn prepare(scratch_root: &Path, name: &str) -> Result<Self> {
        let root = scratch_root.join(name);
        remove_dir_if_exists(&root).await?;

        for sub in [ENCRYPTED_DIR, DECRYPTED_DIR, STAGING_DIR] {
            ensure_directory_exists(&root.join(sub)).await?;
        }

        tracing::debug!(scratch = %root.display(), "scratch directory prepared");
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn encrypted_dir(&self) -> PathBuf {
        self.root.join(ENCRYPTED_DIR)
    }

    pub fn decrypted_dir(&self) -> PathBuf {
        self.root.join(DECRYPTED_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Remove the scratch directory, except subtrees the policy retains
    pub async fn cleanup(&self, policy: RetainPolicy) -> Result<()> {
        if !policy.retains_anything() {
            return remove_dir_if_exists(&self.root).await;
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| LiberatorError::file_io("read_dir", &self.root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LiberatorError::file_io("read_dir", &self.root, e))?
        {
            let name = entry.file_name();
            let keep = (policy.keep_encrypted && name == ENCRYPTED_DIR)
                || (policy.keep_decrypted && name == DECRYPTED_DIR);
            if keep {
                continue;
            }

            let path = entry.path();
            if path.is_dir() {
                remove_dir_if_exists(&path).await?;
            } else {
                fs::remove_file(&path)
                    .await
                    .map_err(|e| LiberatorError::file_io("remove_file", &path, e))?;
            }
        }

        tracing::info!(scratch = %self.root.display(), "scratch data retained");
        Ok(())
    }
}

/// Moves finished artifacts into the output root
#[derive(Debug, Clone)]
pub struct FileManager {
    output_root: PathBuf,
}

impl FileManager {
    pub fn new(output_root: PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Promote `source` to `<output_root>/<relative>`
    ///
    /// Returns the final path, which differs from the requested one when a
    /// file with that name already exists or is being promoted concurrently.
    pub async fn promote(&self, source: &Path, relative: &Path) -> Result<PathBuf> {
        let requested = self.output_root.join(relative);
        if let Some(parent) = requested.parent() {
            ensure_directory_exists(parent).await?;
        }

        let destination = claim_destination(&requested).await?;
        if let Err(e) = self.safe_move(source, &destination).await {
            let _ = fs::remove_file(&destination).await;
            return Err(e);
        }

        tracing::info!(output = %destination.display(), "artifact promoted");
        Ok(destination)
    }

    /// Move with retry
    pub async fn safe_move(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match try_move(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(LiberatorError::FileIoError(format!(
                        "Failed to move file after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(e) => {
                    tracing::debug!(attempt = attempts, error = %e, "move failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

/// Rename, or copy to a hidden sibling and rename when the source lives on
/// another filesystem
async fn try_move(source: &Path, destination: &Path) -> Result<()> {
    if !file_exists(source).await {
        return Err(LiberatorError::FileNotFound(source.display().to_string()));
    }

    if fs::rename(source, destination).await.is_ok() {
        return Ok(());
    }

    let partial = partial_path(destination);
    fs::copy(source, &partial)
        .await
        .map_err(|e| LiberatorError::file_io("copy", source, e))?;

    if let Err(e) = fs::rename(&partial, destination).await {
        let _ = fs::remove_file(&partial).await;
        return Err(LiberatorError::file_io("rename", destination, e));
    }

    fs::remove_file(source)
        .await
        .map_err(|e| LiberatorError::file_io("remove_file", source, e))
}

fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    destination.with_file_name(format!(".{}.partial", name))
}

/// Highest collision suffix tried before giving up
const MAX_NAME_CANDIDATES: u32 = 9999;

/// Reserve the first free name among `path`, `stem (1).ext`, `stem (2).ext`, ...
///
/// The name is claimed by creating an empty placeholder with `create_new`,
/// so two promotions can never pick the same destination. The placeholder
/// is replaced by the artifact's rename.
pub async fn claim_destination(path: &Path) -> Result<PathBuf> {
    for counter in 0..=MAX_NAME_CANDIDATES {
        let candidate = candidate_name(path, counter);
        match fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(LiberatorError::file_io("create", &candidate, e)),
        }
    }

    Err(LiberatorError::FileIoError(format!(
        "no free output name for {} after {} attempts",
        path.display(),
        MAX_NAME_CANDIDATES
    )))
}

/// `path` for 0, `stem (n).ext` otherwise
fn candidate_name(path: &Path, counter: u32) -> PathBuf {
    if counter == 0 {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let new_name = match path.extension().and_then(|s| s.to_str()) {
        Some(extension) if !extension.is_empty() => format!("{} ({}).{}", stem, counter, extension),
        _ => format!("{} ({})", stem, counter),
    };
    parent.join(new_name)
}

/// Ensure directory exists, creating parent directories as needed
pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| LiberatorError::file_io("create_dir", path, e))
}

pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LiberatorError::file_io("remove_dir", path, e)),
    }
}

pub async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
