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


//! In-memory catalog for pipeline tests

use crate::api::models::{BorrowResponse, BorrowsRemaining, ContentItem, TitleRecord};
use crate::api::source::{ContentSource, Session};
use crate::assembler::archive::zip_directory;
use crate::crypto::key::wrap_key;
use crate::crypto::{FileKey, IvScheme, StreamCipher, WrappedKey};
use crate::error::{LiberatorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PATRON_ID: i64 = 42;
pub const FILE_KEY: [u8; 16] = *b"0123456789abcdef";

pub fn title_record(json: serde_json::Value) -> TitleRecord {
    serde_json::from_value(json).expect("valid title record")
}

pub fn comic_record(id: i64, media_key: &str, title: &str, subtitle: Option<&str>) -> TitleRecord {
    title_record(serde_json::json!({
        "id": id,
        "title": title,
        "kind": {"id": 10},
        "contents": [{"mediaKey": media_key, "circId": id * 1001, "title": title, "subtitle": subtitle}]
    }))
}

pub fn ebook_record(id: i64, media_key: &str, title: &str) -> TitleRecord {
    title_record(serde_json::json!({
        "id": id,
        "title": title,
        "kind": {"id": 5},
        "contents": [{"mediaKey": media_key, "circId": id * 1001}]
    }))
}

pub fn music_record(id: i64) -> TitleRecord {
    title_record(serde_json::json!({
        "id": id,
        "title": "Album",
        "kind": {"id": 6},
        "contents": [{"mediaKey": "music", "circId": 1}]
    }))
}

#[derive(Default)]
struct Catalog {
    borrowed: Vec<TitleRecord>,
    titles: HashMap<i64, TitleRecord>,
    borrows_remaining: Option<i64>,
    borrow_calls: Vec<i64>,
    archives: HashMap<String, PathBuf>,
}

/// Serves encrypted archives built on disk under `root`
pub struct FakeSource {
    root: PathBuf,
    catalog: Mutex<Catalog>,
}

impl FakeSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.join("fake-source"),
            catalog: Mutex::new(Catalog::default()),
        }
    }

    fn catalog(&self) -> std::sync::MutexGuard<'_, Catalog> {
        self.catalog.lock().expect("catalog lock")
    }

    pub fn add_borrowed(&self, record: TitleRecord) {
        self.catalog().borrowed.push(record);
    }

    pub fn add_title(&self, record: TitleRecord) {
        self.catalog().titles.insert(record.id, record);
    }

    pub fn set_borrows_remaining(&self, remaining: Option<i64>) {
        self.catalog().borrows_remaining = remaining;
    }

    pub fn borrow_calls(&self) -> Vec<i64> {
        self.catalog().borrow_calls.clone()
    }

    /// Zip `files`, encrypting every block-aligned payload with [`FILE_KEY`]
    pub fn add_archive(&self, media_key: &str, files: &[(&str, &[u8])]) {
        let cipher = StreamCipher::new(
            FileKey::from_bytes(FILE_KEY.to_vec()).expect("valid key"),
            media_key,
            IvScheme::Sha1Digest,
        );

        let tree = self.root.join(media_key);
        for (name, body) in files {
            let path = tree.join(name);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
            std::fs::write(&path, cipher.encrypt_bytes(body)).expect("write file");
        }

        let zip = self.root.join(format!("{}.zip", media_key));
        zip_directory(&tree, &zip).expect("zip archive");
        self.catalog().archives.insert(media_key.to_string(), zip);
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn borrowed_titles(&self, _session: &Session) -> Result<Vec<TitleRecord>> {
        Ok(self.catalog().borrowed.clone())
    }

    async fn title_info(&self, _session: &Session, title_id: i64) -> Result<TitleRecord> {
        self.catalog()
            .titles
            .get(&title_id)
            .cloned()
            .ok_or_else(|| LiberatorError::api_failed("no such title", Some(404), None))
    }

    async fn title_details(&self, session: &Session, title_id: i64) -> Result<TitleRecord> {
        self.title_info(session, title_id).await
    }

    async fn borrows_remaining(&self, _session: &Session) -> Result<BorrowsRemaining> {
        Ok(BorrowsRemaining {
            borrows_remaining: self.catalog().borrows_remaining,
            borrows_remaining_message: None,
        })
    }

    async fn borrow(&self, _session: &Session, title_id: i64) -> Result<BorrowResponse> {
        let mut catalog = self.catalog();
        catalog.borrow_calls.push(title_id);
        let titles = catalog.titles.get(&title_id).cloned().into_iter().collect();
        Ok(BorrowResponse {
            message: Some("borrowed".to_string()),
            titles,
        })
    }

    async fn download_archive(&self, _session: &Session, item: &ContentItem, destination: &Path) -> Result<u64> {
        let source = self
            .catalog()
            .archives
            .get(&item.media_key)
            .cloned()
            .ok_or_else(|| LiberatorError::network_error("archive unavailable", false))?;
        Ok(std::fs::copy(source, destination)?)
    }

    async fn wrapped_key(&self, session: &Session, item: &ContentItem) -> Result<WrappedKey> {
        Ok(WrappedKey::new(
            &item.media_key,
            item.circ_id,
            session.patron_id,
            wrap_key(&item.media_key, session.patron_id, &FILE_KEY),
        ))
    }

    async fn playback_token(&self, _session: &Session, _item: &ContentItem) -> Result<String> {
        Ok("playback".to_string())
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        Err(LiberatorError::network_error(format!("offline: {}", url), false))
    }

    async fn download_file(&self, url: &str, _destination: &Path) -> Result<u64> {
        Err(LiberatorError::network_error(format!("offline: {}", url), false))
    }
}
