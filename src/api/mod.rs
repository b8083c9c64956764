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


//! Catalog service access
//!
//! - `client` - reqwest client with retry, all catalog and license endpoints
//! - `models` - wire records and the validated [`ContentItem`]
//! - `source` - the [`ContentSource`] seam and the explicit [`Session`]

pub mod client;
pub mod models;
pub mod source;

pub use client::{large_cover_url, small_cover_url, CatalogClient, ClientConfig, ClientConfigBuilder};
pub use models::{ChapterRecord, ContentItem, ContentKind, TitleRecord};
pub use source::{ContentSource, Session};
