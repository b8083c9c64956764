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


//! Catalog records and the pipeline's item descriptor
//!
//! The wire records ([`TitleRecord`] and friends) mirror the catalog JSON
//! loosely: every field is optional or defaulted, since borrowed-title
//! listings, title lookups and title details each return a different subset.
//! [`ContentItem`] is the validated, read-only view the pipeline works on.

use crate::error::{LiberatorError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Kinds of catalog content the pipeline handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Ebook,
    Audiobook,
    Comic,
}

impl ContentKind {
    pub const EBOOK_ID: i64 = 5;
    pub const MUSIC_ID: i64 = 6;
    pub const MOVIE_ID: i64 = 7;
    pub const AUDIOBOOK_ID: i64 = 8;
    pub const TELEVISION_ID: i64 = 9;
    pub const COMIC_ID: i64 = 10;

    /// Map a catalog kind id; music, movies and television are unsupported
    pub fn from_kind_id(id: i64) -> Option<Self> {
        match id {
            Self::EBOOK_ID => Some(ContentKind::Ebook),
            Self::AUDIOBOOK_ID => Some(ContentKind::Audiobook),
            Self::COMIC_ID => Some(ContentKind::Comic),
            _ => None,
        }
    }

    pub fn kind_id(&self) -> i64 {
        match self {
            ContentKind::Ebook => Self::EBOOK_ID,
            ContentKind::Audiobook => Self::AUDIOBOOK_ID,
            ContentKind::Comic => Self::COMIC_ID,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Ebook => "ebook",
            ContentKind::Audiobook => "audiobook",
            ContentKind::Comic => "comic",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub name: String,
    /// `AUTHOR`, `READER`, ...
    #[serde(default)]
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedRecord {
    #[serde(default)]
    pub name: Option<String>,
}

/// One chapter of an audiobook, times in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub start: f64,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One content entry of a title (the loan lives here)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    #[serde(default)]
    pub media_key: Option<String>,
    #[serde(default)]
    pub circ_id: Option<i64>,
    /// Due timestamp, milliseconds since epoch
    #[serde(default)]
    pub due: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Overrides the title's kind when present
    #[serde(default)]
    pub media_type: Option<i64>,
    #[serde(default)]
    pub chapters: Vec<ChapterRecord>,
}

/// Title as returned by the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleRecord {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub kind: Option<KindRecord>,
    #[serde(default)]
    pub artists: Vec<ArtistRecord>,
    #[serde(default)]
    pub publisher: Option<NamedRecord>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub year: Option<String>,
    /// Milliseconds since epoch
    #[serde(default)]
    pub release_date: Option<i64>,
    #[serde(default)]
    pub genres: Vec<NamedRecord>,
    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub abridged: bool,
    #[serde(default)]
    pub contents: Vec<ContentRecord>,
}

impl TitleRecord {
    /// Effective kind id: the first content's media type wins over the title kind
    pub fn kind_id(&self) -> Option<i64> {
        self.contents
            .first()
            .and_then(|c| c.media_type)
            .or_else(|| self.kind.as_ref().map(|k| k.id))
    }

    pub fn content_kind(&self) -> Option<ContentKind> {
        self.kind_id().and_then(ContentKind::from_kind_id)
    }

    pub fn is_supported(&self) -> bool {
        self.content_kind().is_some()
    }

    fn artists_with(&self, relationship: &str) -> Vec<String> {
        self.artists
            .iter()
            .filter(|a| a.relationship.as_deref() == Some(relationship))
            .map(|a| a.name.clone())
            .collect()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// One borrowed title, validated for the pipeline
///
/// Constructed once from a catalog record and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub title_id: i64,
    pub kind: ContentKind,
    pub media_key: String,
    pub circ_id: i64,
    /// Milliseconds since epoch
    pub due: Option<i64>,
    pub title: String,
    pub subtitle: Option<String>,
    /// Title of the content entry, used for comic names
    pub content_title: Option<String>,
    pub content_subtitle: Option<String>,
    pub authors: Vec<String>,
    pub readers: Vec<String>,
    /// Milliseconds since epoch
    pub release_date: Option<i64>,
    pub year: Option<String>,
    pub publisher: Option<String>,
    pub genres: Vec<String>,
    pub synopsis: Option<String>,
    pub abridged: bool,
    pub chapters: Vec<ChapterRecord>,
}

impl ContentItem {
    /// Validate a catalog record
    ///
    /// # Errors
    /// - `UnsupportedKind` for music, movies, television or unknown kinds
    /// - `MissingRequiredField` when the record carries no loan
    pub fn from_record(record: &TitleRecord) -> Result<Self> {
        let kind = record.content_kind().ok_or(LiberatorError::UnsupportedKind {
            title_id: record.id,
            kind_id: record.kind_id().unwrap_or(-1),
        })?;

        let content = record
            .contents
            .first()
            .ok_or_else(|| LiberatorError::MissingRequiredField(format!("contents of title {}", record.id)))?;
        let media_key = content
            .media_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LiberatorError::MissingRequiredField(format!("mediaKey of title {}", record.id)))?;
        let circ_id = content
            .circ_id
            .ok_or_else(|| LiberatorError::MissingRequiredField(format!("circId of title {}", record.id)))?;

        Ok(Self {
            title_id: record.id,
            kind,
            media_key,
            circ_id,
            due: content.due,
            title: record
                .title
                .clone()
                .or_else(|| content.title.clone())
                .unwrap_or_default(),
            subtitle: non_empty(record.subtitle.clone()),
            content_title: non_empty(content.title.clone()),
            content_subtitle: non_empty(content.subtitle.clone()),
            authors: record.artists_with("AUTHOR"),
            readers: record.artists_with("READER"),
            release_date: record.release_date,
            year: record.year.clone(),
            publisher: record.publisher.as_ref().and_then(|p| p.name.clone()),
            genres: record.genres.iter().filter_map(|g| g.name.clone()).collect(),
            synopsis: non_empty(record.synopsis.clone()),
            abridged: record.abridged,
            chapters: content.chapters.clone(),
        })
    }

    /// Replace descriptive data with a richer record for the same title
    ///
    /// Loan identity (media key, circulation id, due) is kept.
    pub fn with_details(&self, details: &TitleRecord) -> Result<Self> {
        let mut merged = details.clone();
        if merged.contents.is_empty() {
            merged.contents.push(ContentRecord::default());
        }
        let content = &mut merged.contents[0];
        content.media_key = Some(self.media_key.clone());
        content.circ_id = Some(self.circ_id);
        content.due = content.due.or(self.due);
        if merged.kind.is_none() && content.media_type.is_none() {
            content.media_type = Some(self.kind.kind_id());
        }

        let mut item = Self::from_record(&merged)?;
        if item.chapters.is_empty() {
            item.chapters = self.chapters.clone();
        }
        Ok(item)
    }

    /// Authors joined for display and naming
    pub fn author_line(&self) -> String {
        self.authors.join(", ")
    }

    pub fn reader_line(&self) -> String {
        self.readers.join(", ")
    }

    /// Comic/e-book display name: content title, plus `", {subtitle}"`
    pub fn comic_name(&self) -> (String, Option<String>) {
        (
            self.content_title.clone().unwrap_or_else(|| self.title.clone()),
            self.content_subtitle.clone(),
        )
    }
}

impl fmt::Display for ContentItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({:?})", self.kind, self.title_id, self.title)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Response of the token exchange
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default)]
    pub token_status: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatronRecord {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    #[serde(default)]
    pub patrons: Vec<PatronRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowsRemaining {
    #[serde(default)]
    pub borrows_remaining: Option<i64>,
    #[serde(default)]
    pub borrows_remaining_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BorrowResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub titles: Vec<TitleRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE_JSON: &str = r#"{
        "id": 12345,
        "title": "The Long Road",
        "subtitle": "",
        "kind": {"id": 8, "name": "AUDIOBOOK"},
        "artists": [
            {"name": "A. Writer", "relationship": "AUTHOR"},
            {"name": "B. Writer", "relationship": "AUTHOR"},
            {"name": "R. Reader", "relationship": "READER"}
        ],
        "publisher": {"name": "Pub House"},
        "year": 2019,
        "releaseDate": 1546300800000,
        "genres": [{"name": "Fiction"}, {"name": "Drama"}],
        "synopsis": "A story.",
        "abridged": true,
        "contents": [{
            "mediaKey": "9781234_abc",
            "circId": 777,
            "due": 1700000000000,
            "chapters": [{"start": 0, "duration": 300, "title": "One"}]
        }]
    }"#;

    #[test]
    fn test_content_item_from_record() {
        let record: TitleRecord = serde_json::from_str(TITLE_JSON).unwrap();
        let item = ContentItem::from_record(&record).unwrap();

        assert_eq!(item.kind, ContentKind::Audiobook);
        assert_eq!(item.media_key, "9781234_abc");
        assert_eq!(item.circ_id, 777);
        assert_eq!(item.author_line(), "A. Writer, B. Writer");
        assert_eq!(item.reader_line(), "R. Reader");
        assert_eq!(item.year.as_deref(), Some("2019"));
        assert_eq!(item.publisher.as_deref(), Some("Pub House"));
        assert_eq!(item.subtitle, None);
        assert!(item.abridged);
        assert_eq!(item.chapters.len(), 1);
    }

    #[test]
    fn test_media_type_overrides_kind() {
        let record: TitleRecord = serde_json::from_str(
            r#"{"id": 1, "kind": {"id": 5}, "contents": [{"mediaKey": "k", "circId": 2, "mediaType": 10}]}"#,
        )
        .unwrap();
        assert_eq!(record.content_kind(), Some(ContentKind::Comic));
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let record: TitleRecord = serde_json::from_str(
            r#"{"id": 9, "kind": {"id": 7}, "contents": [{"mediaKey": "k", "circId": 2}]}"#,
        )
        .unwrap();
        assert!(!record.is_supported());
        assert!(matches!(
            ContentItem::from_record(&record),
            Err(LiberatorError::UnsupportedKind { title_id: 9, kind_id: 7 })
        ));
    }

    #[test]
    fn test_missing_loan_rejected() {
        let record: TitleRecord = serde_json::from_str(r#"{"id": 3, "kind": {"id": 5}}"#).unwrap();
        assert!(matches!(
            ContentItem::from_record(&record),
            Err(LiberatorError::MissingRequiredField(_))
        ));
    }

    #[test]
    fn test_with_details_keeps_loan_identity() {
        let record: TitleRecord = serde_json::from_str(TITLE_JSON).unwrap();
        let item = ContentItem::from_record(&record).unwrap();

        let details: TitleRecord = serde_json::from_str(
            r#"{"id": 12345, "title": "The Long Road (Unabridged)", "contents": [{"chapters": [
                {"start": 0, "end": 10}, {"start": 10, "end": 20}
            ]}]}"#,
        )
        .unwrap();
        let merged = item.with_details(&details).unwrap();
        assert_eq!(merged.media_key, "9781234_abc");
        assert_eq!(merged.circ_id, 777);
        assert_eq!(merged.kind, ContentKind::Audiobook);
        assert_eq!(merged.title, "The Long Road (Unabridged)");
        assert_eq!(merged.chapters.len(), 2);
    }
}
