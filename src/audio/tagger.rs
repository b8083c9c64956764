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


//! Chapter injection, descriptive tags and cover art for audiobooks
//!
//! # Metadata Embedding Strategy
//! - Chapters: FFMETADATA1 file merged with `-map_metadata 1`, audio copied
//! - Tags: FFmpeg `-metadata` flags (title, album, artist, composer,
//!   copyright, date, genre, description, comment)
//! - Narrator (`©nrt`) and publisher (`©pub`): the mp4 muxer has no
//!   `-metadata` mapping for them, so they are written as item atoms on the
//!   tagged file with `mp4ameta`
//! - Cover art: second input mapped as an `attached_pic` video stream
//!
//! Every pass writes a new file; the input of a pass is never modified.

use super::chapters::ChapterMap;
use crate::api::models::ContentItem;
use crate::assembler::OutputArchive;
use crate::crypto::DecryptedTree;
use crate::error::{LiberatorError, Result};
use crate::file::paths::AudiobookLayout;
use crate::tools::ExternalTool;
use chrono::{DateTime, Utc};
use mp4ameta::{Data, Fourcc};
use std::path::Path;

/// Demuxed, untagged audio produced by the segmented fetch
pub const UNTAGGED_FILE: &str = "notag.m4b";
/// Small cover embedded as artwork
pub const SMALL_COVER_FILE: &str = "cover.tag.jpg";
/// Large cover placed beside the finished book
pub const LARGE_COVER_FILE: &str = "cover.jpg";

const CHAPTERS_FILE: &str = "chapters.txt";
const CHAPTERED_FILE: &str = "chapters.m4b";
const TAGGED_FILE: &str = "tagged.m4b";

pub const NARRATOR_ATOM: [u8; 4] = *b"\xa9nrt";
pub const PUBLISHER_ATOM: [u8; 4] = *b"\xa9pub";

/// Container-level tags in the order they are written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<(&'static str, String)>,
    /// Written after the remux, keyed by item atom
    atoms: Vec<(&'static str, [u8; 4], String)>,
}

impl TagSet {
    pub fn from_item(item: &ContentItem) -> Self {
        let mut set = Self::default();

        set.push("title", item.title.clone());

        let album_title = item.content_title.as_deref().unwrap_or(&item.title);
        let album = match item.content_subtitle.as_deref().or(item.subtitle.as_deref()) {
            Some(subtitle) => format!("{} - {}", album_title, subtitle),
            None => album_title.to_string(),
        };
        set.push("album", album);

        set.push("artist", item.author_line());
        set.push("composer", item.reader_line());
        set.push_atom("narrator", NARRATOR_ATOM, item.reader_line());
        if let Some(publisher) = &item.publisher {
            set.push_atom("publisher", PUBLISHER_ATOM, publisher.clone());
        }

        if item.year.is_some() || item.publisher.is_some() {
            set.push(
                "copyright",
                format!(
                    "©{} {}",
                    item.year.as_deref().unwrap_or_default(),
                    item.publisher.as_deref().unwrap_or_default()
                ),
            );
        }

        if let Some(date) = item.release_date.and_then(format_release_date) {
            set.push("date", date);
        }

        if let Some(genre) = item.genres.first() {
            set.push("genre", genre.clone());
        }

        if let Some(synopsis) = &item.synopsis {
            set.push("description", synopsis.clone());
            set.push("comment", synopsis.clone());
        }

        set
    }

    fn push(&mut self, key: &'static str, value: String) {
        if !value.is_empty() {
            self.tags.push((key, value));
        }
    }

    fn push_atom(&mut self, key: &'static str, atom: [u8; 4], value: String) {
        if !value.is_empty() {
            self.atoms.push((key, atom, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.atoms.iter().find(|(k, _, _)| *k == key).map(|(_, _, v)| v.as_str()))
    }

    /// Item atoms the remuxer cannot write
    pub fn atoms(&self) -> impl Iterator<Item = ([u8; 4], &str)> {
        self.atoms.iter().map(|(_, atom, value)| (*atom, value.as_str()))
    }

    /// `-metadata key=value` pairs
    pub fn to_args(&self) -> Vec<String> {
        self.tags
            .iter()
            .flat_map(|(key, value)| ["-metadata".to_string(), format!("{}={}", key, value)])
            .collect()
    }
}

/// Set the item atoms of `tags` on an existing MP4 file, in place
pub fn write_item_atoms(path: &Path, tags: &TagSet) -> Result<()> {
    if tags.atoms.is_empty() {
        return Ok(());
    }

    let mut tag = mp4ameta::Tag::read_from_path(path).map_err(|e| LiberatorError::file_io("read_tags", path, e))?;
    for (atom, value) in tags.atoms() {
        tag.set_data(Fourcc(atom), Data::Utf8(value.to_string()));
    }
    tag.write_to_path(path)
        .map_err(|e| LiberatorError::file_io("write_tags", path, e))
}

/// Milliseconds since epoch to `YYYY-MM-DDTHH:MM:SS` (UTC)
pub fn format_release_date(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Finishes a decrypted audiobook into a tagged, chaptered `.m4b`
#[derive(Debug, Clone)]
pub struct AudiobookTagger {
    ffmpeg: ExternalTool,
}

impl AudiobookTagger {
    pub fn new(ffmpeg: ExternalTool) -> Self {
        Self { ffmpeg }
    }

    /// Tag `<tree>/notag.m4b` and lay it out under `staging`
    pub async fn assemble(
        &self,
        tree: &DecryptedTree,
        item: &ContentItem,
        staging: &Path,
    ) -> Result<OutputArchive> {
        let root = tree.root();
        let untagged = root.join(UNTAGGED_FILE);
        if !untagged.exists() {
            return Err(LiberatorError::FileNotFound(untagged.display().to_string()));
        }

        let chapters = ChapterMap::from_records(&item.chapters);
        let chapters_file = root.join(CHAPTERS_FILE);
        tokio::fs::write(&chapters_file, chapters.to_ffmetadata())
            .await
            .map_err(|e| LiberatorError::file_io("write", &chapters_file, e))?;

        let chaptered = root.join(CHAPTERED_FILE);
        self.ffmpeg
            .run(chapter_args(&untagged, &chapters_file, &chaptered), None)
            .await?;
        tracing::info!(chapters = chapters.len(), "chapters injected");

        let small_cover = root.join(SMALL_COVER_FILE);
        let cover = non_empty_file(&small_cover).await.then_some(small_cover.as_path());
        if cover.is_none() {
            tracing::info!("no cover artwork available, tagging without it");
        }

        let tags = TagSet::from_item(item);
        let tagged = root.join(TAGGED_FILE);
        self.ffmpeg
            .run(tag_args(&chaptered, cover, &tags, &tagged), None)
            .await?;

        let target = tagged.clone();
        tokio::task::spawn_blocking(move || write_item_atoms(&target, &tags)).await??;

        let layout = AudiobookLayout::new(&item.title, &item.author_line(), item.abridged);
        place_output(root, &tagged, &layout, staging).await
    }
}

/// `-i untagged -i chapters.txt -map_metadata 1 -acodec copy out`
pub fn chapter_args(untagged: &Path, chapters: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        untagged.to_string_lossy().into_owned(),
        "-i".to_string(),
        chapters.to_string_lossy().into_owned(),
        "-map_metadata".to_string(),
        "1".to_string(),
        "-acodec".to_string(),
        "copy".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Tagging pass; chapters are carried over from the first input
pub fn tag_args(input: &Path, cover: Option<&Path>, tags: &TagSet, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), input.to_string_lossy().into_owned()];

    if let Some(cover) = cover {
        args.extend([
            "-i".to_string(),
            cover.to_string_lossy().into_owned(),
            "-map".to_string(),
            "0:a".to_string(),
            "-map".to_string(),
            "1:v".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-disposition:v:0".to_string(),
            "attached_pic".to_string(),
        ]);
    } else {
        args.extend(["-map".to_string(), "0:a".to_string()]);
    }

    args.extend([
        "-map_chapters".to_string(),
        "0".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
    ]);
    args.extend(tags.to_args());
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Move the tagged file and the large cover into `<staging>/<layout dir>/`
pub async fn place_output(
    root: &Path,
    tagged: &Path,
    layout: &AudiobookLayout,
    staging: &Path,
) -> Result<OutputArchive> {
    let book_dir = staging.join(layout.relative_dir());
    tokio::fs::create_dir_all(&book_dir)
        .await
        .map_err(|e| LiberatorError::file_io("create_dir", &book_dir, e))?;

    let staged = book_dir.join(&layout.file_name);
    tokio::fs::rename(tagged, &staged)
        .await
        .map_err(|e| LiberatorError::file_io("rename", tagged, e))?;

    let mut archive = OutputArchive::new(staged, layout.relative_file());

    let large_cover = root.join(LARGE_COVER_FILE);
    if non_empty_file(&large_cover).await {
        let staged_cover = book_dir.join(LARGE_COVER_FILE);
        tokio::fs::rename(&large_cover, &staged_cover)
            .await
            .map_err(|e| LiberatorError::file_io("rename", &large_cover, e))?;
        archive
            .companions
            .push((staged_cover, layout.relative_dir().join(LARGE_COVER_FILE)));
    }

    Ok(archive)
}

async fn non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
