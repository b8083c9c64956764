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


//! Zip writers shared by the assemblers

use crate::error::{LiberatorError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// E-book packages must start with this entry, stored uncompressed
pub const MIMETYPE_ENTRY: &str = "mimetype";

/// Archive every file under `root`, entry names relative to `root`
///
/// A root-level `mimetype` file is written first and stored; everything
/// else is deflated in path order. Returns the number of entries.
pub fn zip_directory(root: &Path, destination: &Path) -> Result<usize> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| LiberatorError::InvalidPath(format!("{}: {}", entry.path().display(), e)))?;
            files.push(relative.to_path_buf());
        }
    }

    let mimetype = Path::new(MIMETYPE_ENTRY);
    files.sort_by_key(|p| p.as_path() != mimetype);

    let mut writer = ZipWriter::new(BufWriter::new(create(destination)?));
    for relative in &files {
        let method = if relative.as_path() == mimetype {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        add_file(&mut writer, &root.join(relative), &entry_name(relative), method)?;
    }
    finish(writer, destination)?;

    Ok(files.len())
}

/// Archive `files` flattened to their base names, deflated
pub fn zip_files_flat(files: &[PathBuf], destination: &Path) -> Result<usize> {
    let mut writer = ZipWriter::new(BufWriter::new(create(destination)?));
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LiberatorError::InvalidPath(path.display().to_string()))?;
        add_file(&mut writer, path, &name, CompressionMethod::Deflated)?;
    }
    finish(writer, destination)?;

    Ok(files.len())
}

/// Extract a downloaded archive into `destination`; returns the entry count
///
/// Entry names escaping `destination` are rejected by the zip reader.
pub fn extract_archive(archive_path: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| LiberatorError::file_io("open", archive_path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    std::fs::create_dir_all(destination).map_err(|e| LiberatorError::file_io("create_dir", destination, e))?;
    archive.extract(destination)?;
    Ok(archive.len())
}

fn add_file(
    writer: &mut ZipWriter<BufWriter<File>>,
    source: &Path,
    name: &str,
    method: CompressionMethod,
) -> Result<()> {
    let options = SimpleFileOptions::default().compression_method(method);
    writer.start_file(name, options)?;

    let mut reader = BufReader::new(
        File::open(source).map_err(|e| LiberatorError::file_io("open", source, e))?,
    );
    std::io::copy(&mut reader, writer).map_err(|e| LiberatorError::file_io("zip", source, e))?;
    Ok(())
}

fn finish(writer: ZipWriter<BufWriter<File>>, destination: &Path) -> Result<()> {
    writer
        .finish()?
        .flush()
        .map_err(|e| LiberatorError::file_io("flush", destination, e))
}

fn create(destination: &Path) -> Result<File> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LiberatorError::file_io("create_dir", parent, e))?;
    }
    File::create(destination).map_err(|e| LiberatorError::file_io("create", destination, e))
}

/// Zip entry names always use `/`
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_zip_directory_puts_stored_mimetype_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("book");
        std::fs::create_dir_all(root.join("META-INF")).unwrap();
        std::fs::write(root.join("META-INF/container.xml"), b"<c/>").unwrap();
        std::fs::write(root.join("content.opf"), b"<p/>").unwrap();
        std::fs::write(root.join("mimetype"), b"application/epub+zip").unwrap();

        let out = dir.path().join("book.zip");
        assert_eq!(zip_directory(&root, &out).unwrap(), 3);

        assert_eq!(
            entry_names(&out),
            vec!["mimetype", "META-INF/container.xml", "content.opf"]
        );

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut first = archive.by_index(0).unwrap();
        assert_eq!(first.compression(), CompressionMethod::Stored);
        let mut body = String::new();
        first.read_to_string(&mut body).unwrap();
        assert_eq!(body, "application/epub+zip");
    }

    #[test]
    fn test_zip_files_flat_drops_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let file = dir.path().join("a/b/page.jpg");
        std::fs::write(&file, b"jpg").unwrap();

        let out = dir.path().join("x.cbz");
        zip_files_flat(&[file], &out).unwrap();
        assert_eq!(entry_names(&out), vec!["page.jpg"]);
    }

    #[test]
    fn test_extract_archive_restores_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("src");
        std::fs::create_dir_all(root.join("OEBPS")).unwrap();
        std::fs::write(root.join("OEBPS/ch1.xhtml"), b"<html/>").unwrap();
        std::fs::write(root.join("empty.bin"), b"").unwrap();

        let out = dir.path().join("loan.zip");
        zip_directory(&root, &out).unwrap();

        let target = dir.path().join("extracted");
        assert_eq!(extract_archive(&out, &target).unwrap(), 2);
        assert_eq!(std::fs::read(target.join("OEBPS/ch1.xhtml")).unwrap(), b"<html/>");
        assert_eq!(std::fs::metadata(target.join("empty.bin")).unwrap().len(), 0);
    }
}
