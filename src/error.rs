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


//! Error types for LoanLiberator
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (API, crypto, manifest, external tools,
//! files) so the batch runner can decide what a failure means for one item.
//!
//! ## Failure scope
//!
//! Every variant is scoped to the item being processed. The batch runner logs
//! the cause together with the item identity and moves on to the next item.
//!
//! Two outcomes are deliberately *not* errors:
//! - a file that cannot be decrypted is copied verbatim
//!   (see `crypto::stream::DecryptionOutcome::CopiedVerbatim`)
//! - an e-book whose manifest cannot be repaired is archived as a whole tree
//!   (see `assembler::epub`)

use thiserror::Error;

/// Result type alias using our LiberatorError type
pub type Result<T> = std::result::Result<T, LiberatorError>;

/// Main error type for LoanLiberator
#[derive(Error, Debug)]
pub enum LiberatorError {
    // ===== API Errors =====

    /// Token exchange or user lookup failed
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Generic catalog API request failure
    #[error("API request failed: {message}")]
    ApiRequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// API endpoint that failed
        endpoint: Option<String>,
    },

    /// API returned invalid or unexpected response format
    #[error("Invalid API response: {message}")]
    InvalidApiResponse {
        message: String,
        /// Response body snippet for debugging
        response_body: Option<String>,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    // ===== Item Errors =====

    /// Content kind outside the supported set (e-book, comic, audiobook)
    #[error("Unsupported content kind {kind_id} for title {title_id}")]
    UnsupportedKind { title_id: i64, kind_id: i64 },

    /// Required field is missing from a catalog record
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    // ===== Crypto/DRM Errors =====

    /// Wrapped file key could not be unwrapped (bad padding, bad length)
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Content key for segmented media is malformed or unavailable
    #[error("Invalid content key: {0}")]
    InvalidContentKey(String),

    /// Protection header missing from a streaming manifest
    #[error("No Widevine PSSH found in manifest")]
    PsshNotFound,

    // ===== Manifest Errors =====

    /// Structured markup still unparseable after the repair attempt
    #[error("Manifest corrupt ({document}): {reason}")]
    ManifestCorrupt { document: String, reason: String },

    // ===== External Tool Errors =====

    /// External binary exited with a non-zero status
    #[error("{tool} exited with status {status}: {stderr}")]
    ExternalToolFailure {
        tool: String,
        status: i32,
        stderr: String,
    },

    /// External binary could not be launched
    #[error("{0} not found. Please install it and ensure it's in your PATH.")]
    ExternalToolNotFound(String),

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error with context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Invalid file path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ===== Configuration/State Errors =====

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("Configuration parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Archive read/write error
    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Base64 decoding error (license payloads)
    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<walkdir::Error> for LiberatorError {
    fn from(err: walkdir::Error) -> Self {
        LiberatorError::FileIoError(format!("Directory walk failed: {}", err))
    }
}

impl From<tokio::task::JoinError> for LiberatorError {
    fn from(err: tokio::task::JoinError) -> Self {
        LiberatorError::InternalError(format!("Background task failed: {}", err))
    }
}

// Helper methods for creating common errors
impl LiberatorError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LiberatorError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        LiberatorError::InternalError(message.into())
    }

    /// Create an ApiRequestFailed error
    pub fn api_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        LiberatorError::ApiRequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        LiberatorError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create a ManifestCorrupt error for the named document
    pub fn manifest_corrupt<D: Into<String>, R: Into<String>>(document: D, reason: R) -> Self {
        LiberatorError::ManifestCorrupt {
            document: document.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileIoError carrying the operation and path
    pub fn file_io(operation: &str, path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        LiberatorError::FileIoError(format!("{}: {} - {}", operation, path.display(), err))
    }

    /// Check if error is retryable (network errors, 5xx responses)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LiberatorError::NetworkError { is_transient: true, .. }
                | LiberatorError::ApiRequestFailed { status_code: Some(500..=599), .. }
        )
    }

    /// Check if error is related to DRM/crypto operations
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            LiberatorError::KeyDerivation(_)
                | LiberatorError::InvalidContentKey(_)
                | LiberatorError::PsshNotFound
                | LiberatorError::Base64Error(_)
        )
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            LiberatorError::FileNotFound(_)
                | LiberatorError::FileIoError(_)
                | LiberatorError::InvalidPath(_)
                | LiberatorError::IoError(_)
                | LiberatorError::ZipError(_)
        )
    }

    /// Check if error is confined to the item that raised it
    ///
    /// Configuration errors are the only ones that make continuing the batch
    /// pointless, since every following item would fail the same way.
    pub fn is_item_scoped(&self) -> bool {
        !matches!(
            self,
            LiberatorError::InvalidConfiguration(_) | LiberatorError::TomlError(_)
        )
    }

    /// Short category label used in structured log fields
    pub fn category(&self) -> &'static str {
        if self.is_crypto_error() {
            "crypto"
        } else if self.is_file_error() {
            "file"
        } else {
            match self {
                LiberatorError::ManifestCorrupt { .. } => "manifest",
                LiberatorError::ExternalToolFailure { .. }
                | LiberatorError::ExternalToolNotFound(_) => "tool",
                LiberatorError::AuthenticationFailed { .. }
                | LiberatorError::ApiRequestFailed { .. }
                | LiberatorError::InvalidApiResponse { .. }
                | LiberatorError::NetworkError { .. }
                | LiberatorError::ReqwestError(_) => "network",
                _ => "other",
            }
        }
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            LiberatorError::AuthenticationFailed { message } => {
                format!("Login failed: {}. Please check your credentials and try again.", message)
            }
            LiberatorError::KeyDerivation(_) => {
                "The title key could not be unwrapped. The loan may have expired or belong to another patron.".to_string()
            }
            LiberatorError::ExternalToolNotFound(tool) => {
                format!("{} is required but not found. Please install it and ensure it's in your PATH.", tool)
            }
            LiberatorError::UnsupportedKind { title_id, .. } => {
                format!("Title {} is not an e-book, comic or audiobook and was skipped.", title_id)
            }
            _ => self.to_string(),
        }
    }
}
