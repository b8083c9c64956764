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


//! Chapter maps and the FFmpeg metadata text format
//!
//! # FFMETADATA1
//! ```text
//! ;FFMETADATA1
//! [CHAPTER]
//! TIMEBASE=1/1000
//! START=0
//! END=300000
//! title=Chapter One
//! ```
//! Values escape `\ = ; #` and newline with a backslash.

use crate::api::models::ChapterRecord;

/// One chapter boundary in whole milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub start_ms: i64,
    pub end_ms: i64,
    /// Title escaped for the metadata file; `None` when blank
    pub title: Option<String>,
}

/// Ordered, non-decreasing chapters of one audiobook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterMap {
    chapters: Vec<Chapter>,
}

impl ChapterMap {
    /// Build from catalog chapter records (times in seconds)
    ///
    /// End is `end`, else `start + duration`, else the next chapter's
    /// start. Starts that go backwards are clamped to the previous start.
    pub fn from_records(records: &[ChapterRecord]) -> Self {
        let mut chapters: Vec<Chapter> = Vec::with_capacity(records.len());
        let mut previous_start = 0;

        for (i, record) in records.iter().enumerate() {
            let mut start_ms = seconds_to_ms(record.start);
            if start_ms < previous_start {
                tracing::warn!(chapter = i, start_ms, previous_start, "chapter start moved backwards, clamping");
                start_ms = previous_start;
            }

            let end_seconds = record
                .end
                .or_else(|| record.duration.map(|d| record.start + d))
                .or_else(|| records.get(i + 1).map(|next| next.start));
            let end_ms = end_seconds.map(seconds_to_ms).unwrap_or(start_ms).max(start_ms);

            let title = record
                .title
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(escape_metadata);

            chapters.push(Chapter { start_ms, end_ms, title });
            previous_start = start_ms;
        }

        Self { chapters }
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    /// Render the metadata text consumed by the remuxer
    pub fn to_ffmetadata(&self) -> String {
        let mut content = String::from(";FFMETADATA1\n");

        for chapter in &self.chapters {
            content.push_str("[CHAPTER]\n");
            content.push_str("TIMEBASE=1/1000\n");
            content.push_str(&format!("START={}\n", chapter.start_ms));
            content.push_str(&format!("END={}\n", chapter.end_ms));
            if let Some(title) = &chapter.title {
                content.push_str(&format!("title={}\n", title));
            }
        }

        content
    }
}

/// Backslash-escape `\ = ; #` and newline
pub fn escape_metadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '=' | ';' | '#' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn seconds_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: f64, end: Option<f64>, duration: Option<f64>, title: Option<&str>) -> ChapterRecord {
        ChapterRecord {
            start,
            end,
            duration,
            title: title.map(String::from),
        }
    }

    #[test]
    fn test_chapter_map_from_duration_and_end() {
        let map = ChapterMap::from_records(&[
            record(0.0, None, Some(300.0), None),
            record(300.0, Some(700.0), None, Some("A;B")),
        ]);

        assert_eq!(
            map.chapters(),
            &[
                Chapter { start_ms: 0, end_ms: 300_000, title: None },
                Chapter { start_ms: 300_000, end_ms: 700_000, title: Some("A\\;B".to_string()) },
            ]
        );
    }

    #[test]
    fn test_empty_title_is_omitted() {
        let map = ChapterMap::from_records(&[record(0.0, Some(1.5), None, Some(""))]);
        let text = map.to_ffmetadata();
        assert_eq!(text, ";FFMETADATA1\n[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=1500\n");
    }

    #[test]
    fn test_missing_end_uses_next_start() {
        let map = ChapterMap::from_records(&[
            record(0.0, None, None, Some("One")),
            record(42.0, None, None, Some("Two")),
        ]);
        assert_eq!(map.chapters()[0].end_ms, 42_000);
        assert_eq!(map.chapters()[1].end_ms, 42_000);
    }

    #[test]
    fn test_times_never_decrease() {
        let map = ChapterMap::from_records(&[
            record(10.0, Some(20.0), None, None),
            record(5.0, Some(3.0), None, None),
        ]);
        let second = &map.chapters()[1];
        assert_eq!(second.start_ms, 10_000);
        assert_eq!(second.end_ms, 10_000);
    }

    #[test]
    fn test_escape_metadata() {
        assert_eq!(escape_metadata("a=b;c#d\\e\nf"), "a\\=b\\;c\\#d\\\\e\\\nf");
        assert_eq!(escape_metadata("Plain"), "Plain");
    }

    #[test]
    fn test_ffmetadata_contains_every_chapter() {
        let map = ChapterMap::from_records(&[
            record(0.0, Some(300.0), None, Some("Chapter 1")),
            record(300.0, Some(600.0), None, Some("Chapter 2")),
        ]);
        let text = map.to_ffmetadata();
        assert!(text.starts_with(";FFMETADATA1\n"));
        assert_eq!(text.matches("[CHAPTER]").count(), 2);
        assert!(text.contains("START=300000\nEND=600000\ntitle=Chapter 2\n"));
    }
}
