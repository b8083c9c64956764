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


//! The seam between the pipeline and the remote catalog
//!
//! The pipeline only talks to a [`ContentSource`]. [`super::CatalogClient`]
//! is the production implementation; tests supply their own.

use super::models::{BorrowResponse, BorrowsRemaining, ContentItem, TitleRecord};
use crate::crypto::WrappedKey;
use crate::error::Result;
use crate::logging::mask_secret;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// Authenticated identity threaded through every remote call
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    pub user_id: i64,
    pub patron_id: i64,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: i64, patron_id: i64) -> Self {
        Self {
            token: token.into(),
            user_id,
            patron_id,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &mask_secret(&self.token))
            .field("user_id", &self.user_id)
            .field("patron_id", &self.patron_id)
            .finish()
    }
}

/// Remote operations the pipeline depends on
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Titles currently on loan
    async fn borrowed_titles(&self, session: &Session) -> Result<Vec<TitleRecord>>;

    /// Catalog record of any title, borrowed or not
    async fn title_info(&self, session: &Session, title_id: i64) -> Result<TitleRecord>;

    /// Detailed record; the only one carrying audiobook chapters
    async fn title_details(&self, session: &Session, title_id: i64) -> Result<TitleRecord>;

    async fn borrows_remaining(&self, session: &Session) -> Result<BorrowsRemaining>;

    async fn borrow(&self, session: &Session, title_id: i64) -> Result<BorrowResponse>;

    /// Write the item's encrypted zip archive to `destination`
    async fn download_archive(&self, session: &Session, item: &ContentItem, destination: &Path) -> Result<u64>;

    async fn wrapped_key(&self, session: &Session, item: &ContentItem) -> Result<WrappedKey>;

    /// Upfront DRM token for the audiobook license exchange
    async fn playback_token(&self, session: &Session, item: &ContentItem) -> Result<String>;

    /// Unauthenticated GET returning the body as text
    async fn fetch_text(&self, url: &str) -> Result<String>;

    /// Unauthenticated GET streamed to `destination`
    async fn download_file(&self, url: &str, destination: &Path) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_debug_masks_token() {
        let session = Session::new("abcdefghijklmnop", 1, 2);
        let debug = format!("{:?}", session);
        assert!(!debug.contains("abcdefghijklmnop"));
        assert!(debug.contains("patron_id: 2"));
    }
}
