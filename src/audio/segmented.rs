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


//! Segmented (DASH) audiobook acquisition
//!
//! Three external passes, each reading the previous pass's output:
//! 1. `yt-dlp --allow-unplayable-formats -o enc.m4a <mpd>`
//! 2. `mp4decrypt --key <kid:key> enc.m4a dec.m4a`
//! 3. `ffmpeg -i dec.m4a -c:a copy notag.m4b`
//!
//! The intermediate files are removed whether or not the passes succeed.

use super::tagger::UNTAGGED_FILE;
use crate::crypto::ContentKey;
use crate::error::{LiberatorError, Result};
use crate::tools::ExternalTool;
use std::path::{Path, PathBuf};

const ENCRYPTED_AUDIO: &str = "enc.m4a";
const DECRYPTED_AUDIO: &str = "dec.m4a";

/// Streaming manifest location for a media key
pub fn manifest_url(media_key: &str) -> String {
    format!("https://dash.hoopladigital.com/{}/Manifest.mpd", media_key)
}

#[derive(Debug, Clone)]
pub struct SegmentedFetcher {
    downloader: ExternalTool,
    decryptor: ExternalTool,
    ffmpeg: ExternalTool,
}

impl SegmentedFetcher {
    pub fn new(downloader: ExternalTool, decryptor: ExternalTool, ffmpeg: ExternalTool) -> Self {
        Self {
            downloader,
            decryptor,
            ffmpeg,
        }
    }

    /// Fail early when any of the three programs cannot be launched
    pub async fn check_tools(&self) -> Result<()> {
        self.downloader.check_available("--version").await?;
        self.decryptor.check_available("--version").await?;
        self.ffmpeg.check_available("-version").await
    }

    /// Download, decrypt and remux into `<work_dir>/notag.m4b`
    pub async fn fetch(&self, manifest_url: &str, key: &ContentKey, work_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| LiberatorError::file_io("create_dir", work_dir, e))?;

        let encrypted = work_dir.join(ENCRYPTED_AUDIO);
        let decrypted = work_dir.join(DECRYPTED_AUDIO);
        let untagged = work_dir.join(UNTAGGED_FILE);

        let result = self.run_passes(manifest_url, key, &encrypted, &decrypted, &untagged).await;

        for intermediate in [&encrypted, &decrypted] {
            if let Err(e) = tokio::fs::remove_file(intermediate).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %intermediate.display(), error = %e, "failed to remove intermediate audio");
                }
            }
        }

        result.map(|_| untagged)
    }

    async fn run_passes(
        &self,
        manifest_url: &str,
        key: &ContentKey,
        encrypted: &Path,
        decrypted: &Path,
        untagged: &Path,
    ) -> Result<()> {
        tracing::info!(url = manifest_url, "downloading segmented audio");
        self.downloader
            .run(download_args(manifest_url, encrypted), None)
            .await?;

        tracing::info!("decrypting segmented audio");
        self.decryptor
            .run(decrypt_args(key, encrypted, decrypted), None)
            .await?;

        tracing::info!("remuxing decrypted audio");
        self.ffmpeg.run(remux_args(decrypted, untagged), None).await?;

        Ok(())
    }
}

fn download_args(manifest_url: &str, output: &Path) -> Vec<String> {
    vec![
        "--allow-unplayable-formats".to_string(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
        manifest_url.to_string(),
    ]
}

fn decrypt_args(key: &ContentKey, input: &Path, output: &Path) -> Vec<String> {
    vec![
        "--key".to_string(),
        key.to_decryptor_arg(),
        input.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:a".to_string(),
        "copy".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}
