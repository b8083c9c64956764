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


//! E-book container descriptor and package document

use super::xml::{parse_or_repair, XmlDocument};
use crate::error::{LiberatorError, Result};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

pub const CONTAINER_NS: &str = "urn:oasis:names:tc:opendocument:xmlns:container";
pub const OPF_NS: &str = "http://www.idpf.org/2007/opf";
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

/// Location of the container descriptor inside an e-book tree
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// `META-INF/container.xml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    /// Package document path relative to the tree root
    pub rootfile: PathBuf,
}

impl ContainerDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc = parse_or_repair(bytes, "container.xml")?;
        Self::from_document(&doc)
    }

    pub fn from_document(doc: &XmlDocument) -> Result<Self> {
        let full_path = doc
            .root
            .find(CONTAINER_NS, "rootfile")
            .and_then(|e| e.attr("full-path"))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| LiberatorError::manifest_corrupt("container.xml", "no rootfile declaration"))?;

        Ok(Self {
            rootfile: normalize(Path::new(full_path)),
        })
    }

    /// Minimal descriptor declaring `rootfile`, without a byte-order mark
    pub fn render(rootfile: &str) -> String {
        format!(
            concat!(
                "<?xml version=\"1.0\"?>\n",
                "<container version=\"1.0\" xmlns=\"{}\">\n",
                "   <rootfiles>\n",
                "      <rootfile full-path=\"{}\" media-type=\"application/oebps-package+xml\"/>\n",
                "   </rootfiles>\n",
                "</container>\n"
            ),
            CONTAINER_NS,
            escape_attr(rootfile)
        )
    }
}

/// Parsed OPF package document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDocument {
    /// Path of the package document relative to the tree root
    pub path: PathBuf,
    pub title: Option<String>,
    pub creator: Option<String>,
    /// Manifest `href` values as written (not decoded)
    pub hrefs: Vec<String>,
}

impl PackageDocument {
    pub fn parse(path: &Path, bytes: &[u8]) -> Result<Self> {
        let name = path.display().to_string();
        let doc = parse_or_repair(bytes, &name)?;
        Ok(Self::from_document(path, &doc))
    }

    pub fn from_document(path: &Path, doc: &XmlDocument) -> Self {
        let root = &doc.root;
        Self {
            path: normalize(path),
            title: root.find(DC_NS, "title").and_then(|e| e.text_content()).map(String::from),
            creator: root.find(DC_NS, "creator").and_then(|e| e.text_content()).map(String::from),
            hrefs: root
                .find_all(OPF_NS, "item")
                .into_iter()
                .filter_map(|e| e.attr("href"))
                .map(String::from)
                .collect(),
        }
    }

    /// Directory of the package document, relative to the tree root
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or(UNKNOWN_TITLE)
    }

    pub fn author_or_default(&self) -> &str {
        self.creator.as_deref().unwrap_or(UNKNOWN_AUTHOR)
    }

    /// Manifest items, URL-decoded and resolved against the document directory
    pub fn resolved_items(&self) -> Vec<PathBuf> {
        let base = self.base_dir();
        self.hrefs
            .iter()
            .filter_map(|href| resolve_href(base, href))
            .collect()
    }

    /// Files that make up the book: every manifest item plus this document
    pub fn closure(&self) -> BTreeSet<PathBuf> {
        let mut files: BTreeSet<PathBuf> = self.resolved_items().into_iter().collect();
        files.insert(self.path.clone());
        files
    }
}

/// Decode and resolve one manifest href
///
/// Remote references and fragments never name a local file.
pub fn resolve_href(base: &Path, href: &str) -> Option<PathBuf> {
    let href = href.trim();
    if href.is_empty() || href.contains("://") {
        return None;
    }

    let decoded = urlencoding::decode(href)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| href.to_string());
    let without_fragment = decoded.split('#').next().unwrap_or_default().trim();
    if without_fragment.is_empty() {
        return None;
    }

    let resolved = normalize(&base.join(without_fragment));
    (!resolved.as_os_str().is_empty()).then_some(resolved)
}

/// Lexically normalize a relative path, dropping `.` and folding `..`
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}
