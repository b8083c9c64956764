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


//! Runtime configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//! Command-line values are applied on top with [`Config::merge_overrides`].
//!
//! ```toml
//! output_root = "/srv/library"
//! keep_decrypted = false
//! iv_scheme = "sha1_digest"
//! max_concurrent_items = 2
//!
//! [tools]
//! ffmpeg = "/usr/bin/ffmpeg"
//! epub_zip = "/opt/epubzip"
//!
//! [credentials]
//! username = "reader@example.com"
//! password = "..."
//! ```

use crate::api::ClientConfig;
use crate::crypto::{IvScheme, BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use crate::error::{LiberatorError, Result};
use crate::file::RetainPolicy;
use crate::logging::mask_secret;
use crate::tools::ToolSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External program locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub yt_dlp: PathBuf,
    pub mp4decrypt: PathBuf,
    /// Optional e-book packager; the internal zip writer is used without it
    pub epub_zip: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            yt_dlp: PathBuf::from("yt-dlp"),
            mp4decrypt: PathBuf::from("mp4decrypt"),
            epub_zip: None,
        }
    }
}

/// Catalog client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            base_url: client.base_url,
            timeout_secs: client.timeout.as_secs(),
            max_retries: client.max_retries,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .finish()
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Finished archives land here
    pub output_root: PathBuf,
    /// Per-item scratch directories are created under this root
    pub scratch_root: PathBuf,
    pub keep_decrypted: bool,
    pub keep_encrypted: bool,
    /// Treat this directory as the already-extracted encrypted tree
    pub use_existing_download: Option<PathBuf>,
    pub tools: ToolPaths,
    /// Audiobook content key (`KID:KEY` or a bare key)
    pub content_key: Option<String>,
    /// Program and arguments that print a `KID:KEY` line
    pub key_command: Option<Vec<String>>,
    pub iv_scheme: IvScheme,
    /// Decryption chunk size in bytes
    pub chunk_size: usize,
    pub max_concurrent_items: usize,
    pub api: ApiSettings,
    pub credentials: Option<Credentials>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            scratch_root: std::env::temp_dir().join("loan-liberator"),
            keep_decrypted: false,
            keep_encrypted: false,
            use_existing_download: None,
            tools: ToolPaths::default(),
            content_key: None,
            key_command: None,
            iv_scheme: IvScheme::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_items: 1,
            api: ApiSettings::default(),
            credentials: None,
            verbose: false,
            log_file: None,
        }
    }
}

/// Values given on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_root: Option<PathBuf>,
    pub keep_decrypted: bool,
    pub keep_encrypted: bool,
    pub use_existing_download: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub epub_zip: Option<PathBuf>,
    pub content_key: Option<String>,
    pub key_command: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| LiberatorError::file_io("read", path, e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line values; flags only ever switch options on
    pub fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(output_root) = overrides.output_root {
            self.output_root = output_root;
        }
        self.keep_decrypted |= overrides.keep_decrypted;
        self.keep_encrypted |= overrides.keep_encrypted;
        if overrides.use_existing_download.is_some() {
            self.use_existing_download = overrides.use_existing_download;
        }
        if let Some(ffmpeg) = overrides.ffmpeg {
            self.tools.ffmpeg = ffmpeg;
        }
        if overrides.epub_zip.is_some() {
            self.tools.epub_zip = overrides.epub_zip;
        }
        if overrides.content_key.is_some() {
            self.content_key = overrides.content_key;
        }
        if overrides.key_command.is_some() {
            self.key_command = overrides.key_command;
        }

        let (username, password) = match self.credentials.take() {
            Some(c) => (Some(c.username), Some(c.password)),
            None => (None, None),
        };
        self.credentials = match (overrides.username.or(username), overrides.password.or(password)) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        self.verbose |= overrides.verbose;
        if overrides.log_file.is_some() {
            self.log_file = overrides.log_file;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % BLOCK_SIZE != 0 {
            return Err(LiberatorError::InvalidConfiguration(format!(
                "chunk_size must be a positive multiple of {}, got {}",
                BLOCK_SIZE, self.chunk_size
            )));
        }
        if self.max_concurrent_items == 0 {
            return Err(LiberatorError::InvalidConfiguration(
                "max_concurrent_items must be at least 1".to_string(),
            ));
        }
        if matches!(&self.key_command, Some(cmd) if cmd.is_empty()) {
            return Err(LiberatorError::InvalidConfiguration(
                "key_command needs at least a program".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tool_set(&self) -> ToolSet {
        ToolSet::new(
            self.tools.ffmpeg.clone(),
            self.tools.yt_dlp.clone(),
            self.tools.mp4decrypt.clone(),
            self.tools.epub_zip.clone(),
        )
    }

    pub fn retain_policy(&self) -> RetainPolicy {
        RetainPolicy {
            keep_encrypted: self.keep_encrypted,
            keep_decrypted: self.keep_decrypted,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::builder()
            .base_url(self.api.base_url.clone())
            .timeout(Duration::from_secs(self.api.timeout_secs))
            .max_retries(self.api.max_retries)
            .build()
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_root = path.into();
        self
    }

    pub fn scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = path.into();
        self
    }

    pub fn keep_decrypted(mut self, keep: bool) -> Self {
        self.config.keep_decrypted = keep;
        self
    }

    pub fn keep_encrypted(mut self, keep: bool) -> Self {
        self.config.keep_encrypted = keep;
        self
    }

    pub fn use_existing_download(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.use_existing_download = Some(path.into());
        self
    }

    pub fn tools(mut self, tools: ToolPaths) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn iv_scheme(mut self, scheme: IvScheme) -> Self {
        self.config.iv_scheme = scheme;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn max_concurrent_items(mut self, max: usize) -> Self {
        self.config.max_concurrent_items = max;
        self
    }

    pub fn content_key(mut self, key: impl Into<String>) -> Self {
        self.config.content_key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
