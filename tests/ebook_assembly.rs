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


//! E-book packaging against decrypted trees laid out like real downloads

use loan_liberator::assembler::EbookAssembler;
use loan_liberator::crypto::DecryptedTree;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

const NESTED_OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>The Long Road</dc:title>
    <dc:creator>A. Writer</dc:creator>
  </metadata>
  <manifest>
    <item id="c1" href="text/ch%201.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="../images/cover.jpg" media-type="image/jpeg"/>
    <item id="c3" href="text/ch%201.xhtml#part2" media-type="application/xhtml+xml"/>
    <item id="font" href="https://fonts.example.net/serif.woff" media-type="font/woff"/>
  </manifest>
</package>"#;

fn write(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn sorted_entries(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

fn first_entry(path: &Path) -> String {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let name = archive.by_index(0).unwrap().name().to_string();
    name
}

/// Nested package document with a NUL byte that only parses after repair
fn nested_book(dir: &Path) -> PathBuf {
    let root = dir.join("The Long Road");
    write(&root, "mimetype", b"application/epub+zip");
    write(&root, "META-INF/container.xml", CONTAINER.as_bytes());

    let mut opf = NESTED_OPF.as_bytes().to_vec();
    opf.push(0);
    write(&root, "OEBPS/content.opf", &opf);

    write(&root, "OEBPS/text/ch 1.xhtml", b"<html><body>One</body></html>");
    write(&root, "images/cover.jpg", b"\xFF\xD8\xFF\xE0");
    write(&root, "OEBPS/unused.css", b"body {}");
    write(&root, "stray.txt", b"left over");
    root
}

#[tokio::test]
async fn test_nested_package_is_pruned_and_packaged() {
    let dir = TempDir::new().unwrap();
    let root = nested_book(dir.path());
    let staging = dir.path().join("staging");

    let tree = DecryptedTree::from_existing(root.clone());
    let archive = EbookAssembler::default().assemble(&tree, &staging).await.unwrap();

    assert!(!archive.fallback);
    assert_eq!(archive.relative, PathBuf::from("The Long Road - A. Writer.epub"));
    assert_eq!(first_entry(&archive.staged), "mimetype");
    assert_eq!(
        sorted_entries(&archive.staged),
        vec![
            "META-INF/container.xml",
            "OEBPS/META-INF/container.xml",
            "OEBPS/content.opf",
            "OEBPS/text/ch 1.xhtml",
            "images/cover.jpg",
            "mimetype",
        ]
    );

    assert!(!root.join("stray.txt").exists());
    assert!(!root.join("OEBPS/unused.css").exists());
}

#[tokio::test]
async fn test_missing_package_document_archives_whole_tree() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("Half Written");
    write(&root, "META-INF/container.xml", CONTAINER.as_bytes());
    write(&root, "OEBPS/text/ch1.xhtml", b"<html/>");
    write(&root, "notes.txt", b"kept in fallback");
    let staging = dir.path().join("staging");

    let tree = DecryptedTree::from_existing(root.clone());
    let archive = EbookAssembler::default().assemble(&tree, &staging).await.unwrap();

    assert!(archive.fallback);
    assert_eq!(archive.relative, PathBuf::from("Half Written.epub"));
    assert_eq!(
        sorted_entries(&archive.staged),
        vec!["META-INF/container.xml", "OEBPS/text/ch1.xhtml", "notes.txt"]
    );
    assert!(root.join("notes.txt").exists());
}
