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


//! Output naming and layout
//!
//! # Sanitization Rules
//! - Archive names (e-book, comic): `< > : " / \ | ? *` and newline become `_`
//! - Audiobook directory and file names: `\ / : * ? " < > |` are removed
//!
//! Both are idempotent: the replacement character is never in the set, and
//! removal cannot create new forbidden characters.
//!
//! # Layout
//! - `<output_root>/<title> - <author>.epub`
//! - `<output_root>/<title>[, <subtitle>].cbz`
//! - `<output_root>/<title> - <author>[ [Abridged]]/<title>.m4b`

use std::path::{Path, PathBuf};

const ARCHIVE_FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\n'];
const AUDIOBOOK_FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Replace characters that are invalid in archive filenames with `_`
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if ARCHIVE_FORBIDDEN.contains(&c) { '_' } else { c })
        .collect()
}

/// Remove characters that are invalid in audiobook directory/file names
pub fn sanitize_component(name: &str) -> String {
    name.chars().filter(|c| !AUDIOBOOK_FORBIDDEN.contains(c)).collect()
}

/// `"{title} - {author}.epub"`
pub fn ebook_file_name(title: &str, author: &str) -> String {
    format!("{} - {}.epub", sanitize_filename(title), sanitize_filename(author))
}

/// `"{title}.cbz"` or `"{title}, {subtitle}.cbz"`
pub fn comic_file_name(title: &str, subtitle: Option<&str>) -> String {
    let name = match subtitle.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subtitle) => format!("{}, {}", title, subtitle),
        None => title.to_string(),
    };
    format!("{}.cbz", sanitize_filename(&name))
}

/// Fallback e-book name derived from the tree directory
pub fn fallback_ebook_file_name(tree_root: &Path) -> String {
    let dir_name = tree_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ebook".to_string());
    format!("{}.epub", sanitize_filename(&dir_name))
}

/// Directory and file name for a finished audiobook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudiobookLayout {
    /// `"{title} - {author}"`, with `" [Abridged]"` when abridged
    pub directory: String,
    /// `"{title}.m4b"`
    pub file_name: String,
}

impl AudiobookLayout {
    pub fn new(title: &str, author: &str, abridged: bool) -> Self {
        let title = sanitize_component(title);
        let author = sanitize_component(author);

        let mut directory = format!("{} - {}", title, author);
        if abridged {
            directory.push_str(" [Abridged]");
        }

        Self {
            directory,
            file_name: format!("{}.m4b", title),
        }
    }

    /// Directory relative to any root
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.directory)
    }

    /// Media file path relative to any root
    pub fn relative_file(&self) -> PathBuf {
        self.relative_dir().join(&self.file_name)
    }
}

/// Whether `path` has an extension from `allowed` (case-insensitive, with dot)
pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let dotted = format!(".{}", ext.to_ascii_lowercase());
            allowed.iter().any(|a| *a == dotted)
        })
        .unwrap_or(false)
}
