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


//! E-book packaging
//!
//! # Algorithm
//! 1. Load the container descriptor and package document (with repair)
//! 2. Delete every file outside the manifest closure, except `mimetype`
//!    and the container descriptor that named the package document
//! 3. Synthesize `META-INF/container.xml` beside the package document
//!    when none exists there
//! 4. Name the book `"{title} - {author}.epub"`
//! 5. Zip with the external packager when configured, else internally
//!
//! Any failure in 1-5 falls back to zipping the whole tree under a name
//! derived from the tree directory, so decrypted bytes are never dropped.

use super::archive::{zip_directory, MIMETYPE_ENTRY};
use super::OutputArchive;
use crate::crypto::DecryptedTree;
use crate::error::{LiberatorError, Result};
use crate::file::paths::{ebook_file_name, fallback_ebook_file_name};
use crate::manifest::{ContainerDescriptor, ManifestDocument, CONTAINER_PATH};
use crate::tools::ExternalTool;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Book after pruning, ready to be zipped
#[derive(Debug, Clone)]
pub struct PreparedBook {
    pub manifest: ManifestDocument,
    /// Files kept in the tree, relative to its root
    pub kept: BTreeSet<PathBuf>,
    /// Files deleted from the tree, relative to its root
    pub removed: Vec<PathBuf>,
    pub file_name: String,
}

/// Builds `.epub` archives from decrypted trees
#[derive(Debug, Clone, Default)]
pub struct EbookAssembler {
    epub_zip: Option<ExternalTool>,
}

impl EbookAssembler {
    pub fn new(epub_zip: Option<ExternalTool>) -> Self {
        Self { epub_zip }
    }

    /// Package the tree into `staging`; falls back to a whole-tree archive
    pub async fn assemble(&self, tree: &DecryptedTree, staging: &Path) -> Result<OutputArchive> {
        match self.assemble_package(tree.root(), staging).await {
            Ok(archive) => Ok(archive),
            Err(e) => {
                tracing::warn!(
                    tree = %tree.root().display(),
                    error = %e,
                    "e-book assembly failed, archiving the whole tree"
                );
                self.assemble_fallback(tree.root(), staging).await
            }
        }
    }

    async fn assemble_package(&self, root: &Path, staging: &Path) -> Result<OutputArchive> {
        let tree_root = root.to_path_buf();
        let book = tokio::task::spawn_blocking(move || prepare_book(&tree_root)).await??;

        tracing::info!(
            title = book.manifest.package.title_or_default(),
            kept = book.kept.len(),
            removed = book.removed.len(),
            "e-book tree pruned"
        );

        let staging = absolute(staging).await?;
        let destination = staging.join(&book.file_name);

        match &self.epub_zip {
            Some(tool) if tool.program().exists() || tool.program().components().count() == 1 => {
                tool.run([destination.as_os_str()], Some(root)).await?;
                if !destination.exists() {
                    return Err(LiberatorError::ExternalToolFailure {
                        tool: tool.name().to_string(),
                        status: 0,
                        stderr: format!("no archive written to {}", destination.display()),
                    });
                }
            }
            Some(tool) => {
                tracing::warn!(
                    program = %tool.program().display(),
                    "epubzip binary not found, using the internal archiver"
                );
                zip_internal(root, &destination).await?;
            }
            None => zip_internal(root, &destination).await?,
        }

        Ok(OutputArchive::new(destination, PathBuf::from(&book.file_name)))
    }

    async fn assemble_fallback(&self, root: &Path, staging: &Path) -> Result<OutputArchive> {
        let file_name = fallback_ebook_file_name(root);
        let destination = staging.join(&file_name);
        zip_internal(root, &destination).await?;

        let mut archive = OutputArchive::new(destination, PathBuf::from(file_name));
        archive.fallback = true;
        Ok(archive)
    }
}

/// Load manifests, prune, and ensure a container descriptor exists
///
/// Synchronous: walks and mutates the tree.
pub fn prepare_book(root: &Path) -> Result<PreparedBook> {
    let manifest = ManifestDocument::load(root)?;

    let mut kept = manifest.package.closure();
    kept.insert(PathBuf::from(MIMETYPE_ENTRY));
    kept.insert(PathBuf::from(CONTAINER_PATH));

    let removed = prune_tree(root, &kept)?;

    let package_dir = manifest.package.base_dir().to_path_buf();
    let descriptor = root.join(&package_dir).join(CONTAINER_PATH);
    if !descriptor.exists() {
        let rootfile = manifest
            .package
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LiberatorError::InvalidPath(manifest.package.path.display().to_string()))?;
        write_descriptor(&descriptor, &rootfile)?;
        kept.insert(package_dir.join(CONTAINER_PATH));
        tracing::debug!(path = %descriptor.display(), "container descriptor synthesized");
    }

    let file_name = ebook_file_name(
        manifest.package.title_or_default(),
        manifest.package.author_or_default(),
    );

    Ok(PreparedBook {
        manifest,
        kept,
        removed,
        file_name,
    })
}

/// Delete every file under `root` whose relative path is not in `keep`
fn prune_tree(root: &Path, keep: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| LiberatorError::InvalidPath(format!("{}: {}", entry.path().display(), e)))?
            .to_path_buf();
        if keep.contains(&relative) {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed.push(relative),
            Err(e) => tracing::warn!(file = %relative.display(), error = %e, "could not remove unlisted file"),
        }
    }

    Ok(removed)
}

fn write_descriptor(path: &Path, rootfile: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LiberatorError::file_io("create_dir", parent, e))?;
    }
    std::fs::write(path, ContainerDescriptor::render(rootfile).as_bytes())
        .map_err(|e| LiberatorError::file_io("write", path, e))
}

/// Zip to `<name>.zip`, then rename to the target extension
async fn zip_internal(root: &Path, destination: &Path) -> Result<()> {
    let root = root.to_path_buf();
    let zip_path = destination.with_extension("zip");
    let target = zip_path.clone();
    tokio::task::spawn_blocking(move || zip_directory(&root, &target)).await??;

    tokio::fs::rename(&zip_path, destination)
        .await
        .map_err(|e| LiberatorError::file_io("rename", &zip_path, e))
}

async fn absolute(path: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| LiberatorError::file_io("create_dir", path, e))?;
    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| LiberatorError::file_io("canonicalize", path, e))
}
