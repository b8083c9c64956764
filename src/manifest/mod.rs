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


//! Tolerant manifest parsing for decrypted e-book trees
//!
//! # Documents
//! - `META-INF/container.xml` names the package document (rootfile)
//! - the package document (OPF) lists the book's files and metadata
//!
//! Both are read through [`parse_or_repair`], which retries once after
//! stripping NUL bytes and replacement characters.

pub mod package;
pub mod xml;

pub use package::{
    normalize, resolve_href, ContainerDescriptor, PackageDocument, CONTAINER_PATH, UNKNOWN_AUTHOR,
    UNKNOWN_TITLE,
};
pub use xml::{parse_or_repair, repair_text, XmlDocument, XmlElement};

use crate::error::{LiberatorError, Result};
use std::path::Path;

/// Container descriptor plus the package document it points to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDocument {
    pub container: ContainerDescriptor,
    pub package: PackageDocument,
}

impl ManifestDocument {
    /// Read both documents from a decrypted tree
    ///
    /// # Errors
    /// - `ManifestCorrupt` if either document is missing or unparseable, or
    ///   the rootfile does not exist inside the tree
    pub fn load(tree_root: &Path) -> Result<Self> {
        let container_bytes = read_document(tree_root, Path::new(CONTAINER_PATH))?;
        let container = ContainerDescriptor::parse(&container_bytes)?;

        let package_bytes = read_document(tree_root, &container.rootfile)?;
        let package = PackageDocument::parse(&container.rootfile, &package_bytes)?;

        tracing::debug!(
            rootfile = %container.rootfile.display(),
            items = package.hrefs.len(),
            "manifest loaded"
        );
        Ok(Self { container, package })
    }

    pub fn rootfile(&self) -> &Path {
        &self.container.rootfile
    }
}

fn read_document(tree_root: &Path, relative: &Path) -> Result<Vec<u8>> {
    let path = tree_root.join(relative);
    std::fs::read(&path).map_err(|e| {
        LiberatorError::manifest_corrupt(relative.display().to_string(), format!("cannot read: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_load_resolves_rootfile() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("META-INF")).unwrap();
        std::fs::create_dir_all(dir.path().join("OPS")).unwrap();
        std::fs::write(
            dir.path().join(CONTAINER_PATH),
            ContainerDescriptor::render("OPS/book.opf"),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("OPS/book.opf"),
            r#"<package xmlns="http://www.idpf.org/2007/opf"><manifest><item href="a.xhtml"/></manifest></package>"#,
        )
        .unwrap();

        let manifest = ManifestDocument::load(dir.path()).unwrap();
        assert_eq!(manifest.rootfile(), Path::new("OPS/book.opf"));
        assert_eq!(manifest.package.resolved_items(), vec![PathBuf::from("OPS/a.xhtml")]);
    }

    #[test]
    fn test_load_missing_rootfile_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("META-INF")).unwrap();
        std::fs::write(
            dir.path().join(CONTAINER_PATH),
            ContainerDescriptor::render("content.opf"),
        )
        .unwrap();

        assert!(matches!(
            ManifestDocument::load(dir.path()),
            Err(LiberatorError::ManifestCorrupt { .. })
        ));
    }
}
