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


//! Which titles a run processes
//!
//! Borrowed titles of a supported kind are taken as-is. A requested title
//! that is not on loan is looked up, and borrowed when its kind is
//! supported and the patron has borrows left. Per-title lookup or borrow
//! failures are logged and skip that title only.

use crate::api::models::{ContentItem, TitleRecord};
use crate::api::source::{ContentSource, Session};
use crate::error::Result;
use std::collections::HashSet;

/// What the user asked for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionRequest {
    pub all_borrowed: bool,
    pub title_ids: Vec<i64>,
}

impl SelectionRequest {
    pub fn all_borrowed() -> Self {
        Self {
            all_borrowed: true,
            title_ids: Vec::new(),
        }
    }

    pub fn titles(title_ids: Vec<i64>) -> Self {
        Self {
            all_borrowed: false,
            title_ids,
        }
    }
}

/// Resolve the request into validated items, borrowing where needed
pub async fn select_titles(
    source: &dyn ContentSource,
    session: &Session,
    request: &SelectionRequest,
) -> Result<Vec<ContentItem>> {
    let borrowed: Vec<TitleRecord> = source
        .borrowed_titles(session)
        .await?
        .into_iter()
        .filter(TitleRecord::is_supported)
        .collect();
    tracing::info!(count = borrowed.len(), "titles already borrowed");

    let mut selected: Vec<TitleRecord> = if request.all_borrowed {
        borrowed.clone()
    } else {
        borrowed
            .iter()
            .filter(|t| request.title_ids.contains(&t.id))
            .cloned()
            .collect()
    };

    let borrowed_ids: HashSet<i64> = borrowed.iter().map(|t| t.id).collect();
    let mut to_borrow: Vec<i64> = Vec::new();
    if !request.all_borrowed {
        for id in &request.title_ids {
            if !borrowed_ids.contains(id) && !to_borrow.contains(id) {
                to_borrow.push(*id);
            }
        }
    }

    if !to_borrow.is_empty() {
        selected.extend(borrow_titles(source, session, &to_borrow).await?);
    }

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(selected.len());
    for record in selected {
        if !seen.insert(record.id) {
            continue;
        }
        match ContentItem::from_record(&record) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(title_id = record.id, error = %e, "skipping title"),
        }
    }

    Ok(items)
}

async fn borrow_titles(source: &dyn ContentSource, session: &Session, title_ids: &[i64]) -> Result<Vec<TitleRecord>> {
    let remaining = source.borrows_remaining(session).await?;
    if let Some(message) = &remaining.borrows_remaining_message {
        tracing::info!("{}", message);
    }
    let mut borrows_left = remaining.borrows_remaining;

    let mut borrowed = Vec::new();
    for &title_id in title_ids {
        let info = match source.title_info(session, title_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(title_id, error = %e, "title lookup failed, skipping");
                continue;
            }
        };

        if !info.is_supported() {
            tracing::warn!(title_id, kind = ?info.kind_id(), "title is not a supported kind, skipping");
            continue;
        }

        if matches!(borrows_left, Some(n) if n <= 0) {
            tracing::warn!(title_id, "title not borrowed and no borrows remaining, skipping");
            continue;
        }

        tracing::info!(title_id, "borrowing title");
        match source.borrow(session, title_id).await {
            Ok(response) => {
                if let Some(message) = &response.message {
                    tracing::info!(title_id, "{}", message);
                }
                borrows_left = borrows_left.map(|n| n - 1);
                borrowed.extend(response.titles.into_iter().filter(|t| t.id == title_id));
            }
            Err(e) => tracing::error!(title_id, error = %e, "borrow failed, skipping"),
        }
    }

    Ok(borrowed)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{comic_record, ebook_record, music_record, FakeSource, PATRON_ID};
    use super::*;
    use tempfile::TempDir;

    fn session() -> Session {
        Session::new("token", 7, PATRON_ID)
    }

    fn ids(items: &[ContentItem]) -> Vec<i64> {
        items.iter().map(|i| i.title_id).collect()
    }

    #[tokio::test]
    async fn test_all_borrowed_skips_unsupported() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_borrowed(comic_record(1, "a", "A", None));
        source.add_borrowed(music_record(2));
        source.add_borrowed(ebook_record(3, "c", "C"));

        let items = select_titles(&source, &session(), &SelectionRequest::all_borrowed())
            .await
            .unwrap();
        assert_eq!(ids(&items), vec![1, 3]);
        assert!(source.borrow_calls().is_empty());
    }

    #[tokio::test]
    async fn test_requested_titles_are_borrowed() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_borrowed(comic_record(1, "a", "A", None));
        source.add_borrowed(comic_record(5, "e", "E", None));
        source.add_title(ebook_record(2, "b", "B"));
        source.add_title(music_record(3));
        source.set_borrows_remaining(Some(5));

        let request = SelectionRequest::titles(vec![1, 2, 3, 4]);
        let items = select_titles(&source, &session(), &request).await.unwrap();

        // 3 is music, 4 is unknown to the catalog
        assert_eq!(ids(&items), vec![1, 2]);
        assert_eq!(source.borrow_calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_no_borrows_remaining() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_title(ebook_record(2, "b", "B"));
        source.add_title(ebook_record(3, "c", "C"));
        source.set_borrows_remaining(Some(1));

        let request = SelectionRequest::titles(vec![2, 3]);
        let items = select_titles(&source, &session(), &request).await.unwrap();

        assert_eq!(ids(&items), vec![2]);
        assert_eq!(source.borrow_calls(), vec![2]);
    }
}
