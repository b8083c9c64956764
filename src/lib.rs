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


//! LoanLiberator core library
//!
//! Fetches borrowed library titles, removes the per-title protection and
//! repackages the plaintext as `.epub`, `.cbz` or a tagged `.m4b`.
//!
//! # Modules
//! - `api` - catalog client, wire records, the content-source seam
//! - `crypto` - file-key unwrap, streamed CBC decryption, Widevine seam
//! - `manifest` - tolerant e-book container/package parsing
//! - `assembler` - e-book and comic archives, kind dispatch
//! - `audio` - segmented audiobook fetch, chapters and tags
//! - `pipeline` - per-item state machine, title selection, batch runner
//! - `file` - scratch directories, naming, promotion into the output root
//! - `tools` - external program invocation
//! - `config`, `logging`, `error` - ambient plumbing

pub mod api;
pub mod assembler;
pub mod audio;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod tools;

pub use api::{CatalogClient, ContentItem, ContentKind, ContentSource, Session};
pub use config::{Config, ConfigOverrides};
pub use error::{LiberatorError, Result};
pub use pipeline::{select_titles, BatchReport, Liberator, SelectionRequest};
