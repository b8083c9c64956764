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


//! Comic book archives (`.cbz`)
//!
//! Only files directly under the tree root with an image extension are
//! archived, flattened and deflated. The extension alone decides; an empty
//! `.jpg` is still a page.

use super::archive::zip_files_flat;
use super::OutputArchive;
use crate::crypto::DecryptedTree;
use crate::error::{LiberatorError, Result};
use crate::file::paths::{comic_file_name, has_extension};
use std::path::{Path, PathBuf};

/// Extensions accepted as comic pages
pub const COMIC_IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tif", ".tiff"];

#[derive(Debug, Clone, Default)]
pub struct ComicAssembler;

impl ComicAssembler {
    pub fn new() -> Self {
        Self
    }

    pub async fn assemble(
        &self,
        tree: &DecryptedTree,
        title: &str,
        subtitle: Option<&str>,
        staging: &Path,
    ) -> Result<OutputArchive> {
        let file_name = comic_file_name(title, subtitle);
        let destination = staging.join(&file_name);

        let root = tree.root().to_path_buf();
        let target = destination.clone();
        let pages = tokio::task::spawn_blocking(move || -> Result<usize> {
            let pages = list_pages(&root)?;
            zip_files_flat(&pages, &target)
        })
        .await??;

        tracing::info!(pages, archive = %file_name, "comic archived");
        Ok(OutputArchive::new(destination, PathBuf::from(file_name)))
    }
}

/// Image files directly under `root`, sorted by name
pub fn list_pages(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root).map_err(|e| LiberatorError::file_io("read_dir", root, e))?;

    let mut pages = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LiberatorError::file_io("read_dir", root, e))?;
        let path = entry.path();
        if path.is_file() && has_extension(&path, COMIC_IMAGE_EXTENSIONS) {
            pages.push(path);
        }
    }
    pages.sort();
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_only_images_are_archived() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("a.jpg"), b"jpg").unwrap();
        std::fs::write(root.join("b.png"), b"png").unwrap();
        std::fs::write(root.join("notes.txt"), b"txt").unwrap();
        std::fs::write(root.join("nested/c.jpg"), b"jpg").unwrap();

        let archive = ComicAssembler::new()
            .assemble(&DecryptedTree::from_existing(root), "Saga", Some("Vol. 1"), dir.path())
            .await
            .unwrap();

        assert_eq!(archive.relative, PathBuf::from("Saga, Vol. 1.cbz"));
        assert_eq!(entry_names(&archive.staged), vec!["a.jpg", "b.png"]);
    }

    #[test]
    fn test_extension_filter_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("P1.JPEG"), b"").unwrap();
        std::fs::write(dir.path().join("p2.TIF"), b"x").unwrap();
        std::fs::write(dir.path().join("cover.webp"), b"x").unwrap();

        let pages = list_pages(dir.path()).unwrap();
        let names: Vec<_> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["P1.JPEG", "p2.TIF"]);
    }
}
