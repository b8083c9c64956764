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


//! Output assembly per content kind
//!
//! | Kind      | Input tree                     | Output                              |
//! |-----------|--------------------------------|-------------------------------------|
//! | e-book    | decrypted package files        | `{title} - {author}.epub`           |
//! | comic     | decrypted page images          | `{title}[, {subtitle}].cbz`         |
//! | audiobook | untagged `.m4b` plus covers    | `{title} - {author}/{title}.m4b`    |
//!
//! Assemblers write into a staging directory only. Promotion into the
//! output root is the pipeline's job, so a failed item never leaves a
//! partial file behind.

pub mod archive;
pub mod cbz;
pub mod epub;

pub use cbz::ComicAssembler;
pub use epub::EbookAssembler;

use crate::api::models::{ContentItem, ContentKind};
use crate::audio::AudiobookTagger;
use crate::crypto::DecryptedTree;
use crate::error::{LiberatorError, Result};
use crate::tools::ToolSet;
use std::path::{Path, PathBuf};

/// A finished artifact waiting in staging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArchive {
    /// Location inside the staging directory
    pub staged: PathBuf,
    /// Destination relative to the output root
    pub relative: PathBuf,
    /// Extra files promoted alongside (staged, relative)
    pub companions: Vec<(PathBuf, PathBuf)>,
    /// Whole-tree archive written after packaging failed
    pub fallback: bool,
}

impl OutputArchive {
    pub fn new(staged: PathBuf, relative: PathBuf) -> Self {
        Self {
            staged,
            relative,
            companions: Vec::new(),
            fallback: false,
        }
    }
}

/// Assembler chosen by content kind
#[derive(Debug, Clone)]
pub enum ContentAssembler {
    Ebook(EbookAssembler),
    Comic(ComicAssembler),
    Audiobook(AudiobookTagger),
}

impl ContentAssembler {
    pub fn for_kind(kind: ContentKind, tools: &ToolSet) -> Self {
        match kind {
            ContentKind::Ebook => ContentAssembler::Ebook(EbookAssembler::new(tools.epub_zip.clone())),
            ContentKind::Comic => ContentAssembler::Comic(ComicAssembler::new()),
            ContentKind::Audiobook => ContentAssembler::Audiobook(AudiobookTagger::new(tools.ffmpeg.clone())),
        }
    }

    pub async fn assemble(
        &self,
        tree: &DecryptedTree,
        item: &ContentItem,
        staging: &Path,
    ) -> Result<OutputArchive> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| LiberatorError::file_io("create_dir", staging, e))?;

        match self {
            ContentAssembler::Ebook(assembler) => assembler.assemble(tree, staging).await,
            ContentAssembler::Comic(assembler) => {
                let (title, subtitle) = item.comic_name();
                assembler.assemble(tree, &title, subtitle.as_deref(), staging).await
            }
            ContentAssembler::Audiobook(tagger) => tagger.assemble(tree, item, staging).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_for_kind() {
        let tools = ToolSet::default();
        assert!(matches!(
            ContentAssembler::for_kind(ContentKind::Ebook, &tools),
            ContentAssembler::Ebook(_)
        ));
        assert!(matches!(
            ContentAssembler::for_kind(ContentKind::Comic, &tools),
            ContentAssembler::Comic(_)
        ));
        assert!(matches!(
            ContentAssembler::for_kind(ContentKind::Audiobook, &tools),
            ContentAssembler::Audiobook(_)
        ));
    }
}
