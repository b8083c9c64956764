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


//! Audiobook finishing
//!
//! Audiobooks arrive as a DASH stream rather than an encrypted file tree.
//! The pipeline fetches and decrypts the stream into one untagged `.m4b`,
//! then the tagger injects chapters, tags and cover art.
//!
//! # Module Organization
//! - `segmented` - stream download, segment decryption, remux
//! - `chapters` - chapter maps and the FFMETADATA1 text format
//! - `tagger` - chapter injection, container tags, cover, output layout
//!
//! # FFmpeg Integration
//!
//! FFmpeg must be installed and available in PATH (or configured):
//! - macOS: `brew install ffmpeg`
//! - Linux: `apt-get install ffmpeg` or `yum install ffmpeg`

pub mod chapters;
pub mod segmented;
pub mod tagger;

pub use chapters::{escape_metadata, Chapter, ChapterMap};
pub use segmented::{manifest_url, SegmentedFetcher};
pub use tagger::{AudiobookTagger, TagSet, LARGE_COVER_FILE, SMALL_COVER_FILE, UNTAGGED_FILE};
