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


//! Per-item pipeline and batch runner
//!
//! # Item state machine
//! ```text
//! prepare scratch ─► acquire ─► decrypt ─► assemble ─► promote ─► cleanup
//!                      │                                  ▲
//!                      └── audiobook: fetch stream, tag ──┘
//! ```
//! - e-book / comic: download the zip (or reuse an existing download),
//!   unwrap the file key, decrypt every entry into `decrypted/<title>/`
//! - audiobook: read the Widevine header from the stream manifest, obtain a
//!   content key, run the segmented fetch, download covers
//!
//! Everything up to promotion happens inside `<scratch>/<kind>-<circ>-<ts>/`.
//! Cleanup runs on success and failure; an error never escapes the item.

pub mod selection;

#[cfg(test)]
pub(crate) mod test_support;

pub use selection::{select_titles, SelectionRequest};

use crate::api::client::{large_cover_url, small_cover_url};
use crate::api::models::{ContentItem, ContentKind};
use crate::api::source::{ContentSource, Session};
use crate::assembler::archive::extract_archive;
use crate::assembler::{ContentAssembler, OutputArchive};
use crate::audio::{manifest_url, SegmentedFetcher, LARGE_COVER_FILE, SMALL_COVER_FILE, UNTAGGED_FILE};
use crate::config::Config;
use crate::crypto::{
    decrypt_tree, extract_pssh, CommandKeyProvider, ContentKey, ContentKeyProvider, DecryptedTree, KeyRequest,
    StaticKeyProvider, StreamCipher, LICENSE_URL,
};
use crate::error::{LiberatorError, Result};
use crate::file::paths::sanitize_filename;
use crate::file::{FileManager, ScratchSpace};
use crate::tools::ToolSet;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;

/// One finished item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutput {
    pub item: ContentItem,
    pub path: PathBuf,
    pub companions: Vec<PathBuf>,
    /// E-book packaging failed and the whole tree was archived instead
    pub fallback: bool,
}

/// One failed item
#[derive(Debug)]
pub struct ItemFailure {
    pub item: ContentItem,
    pub error: LiberatorError,
}

/// Outcome of a batch run
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<ItemOutput>,
    pub failed: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn summary(&self) -> String {
        format!("{} of {} items liberated", self.succeeded.len(), self.total())
    }
}

/// Runs items through the pipeline
pub struct Liberator {
    config: Config,
    tools: ToolSet,
    source: Arc<dyn ContentSource>,
    key_provider: Option<Arc<dyn ContentKeyProvider>>,
    files: FileManager,
}

impl Liberator {
    /// Build from configuration; the key provider comes from `content_key`
    /// or `key_command` when either is set
    pub fn new(config: Config, source: Arc<dyn ContentSource>) -> Result<Self> {
        config.validate()?;

        let key_provider: Option<Arc<dyn ContentKeyProvider>> = match (&config.content_key, &config.key_command) {
            (Some(key), _) => Some(Arc::new(StaticKeyProvider::new(ContentKey::parse(key)?))),
            (None, Some(command)) => {
                let (program, args) = command
                    .split_first()
                    .ok_or_else(|| LiberatorError::InvalidConfiguration("key_command is empty".to_string()))?;
                Some(Arc::new(CommandKeyProvider::new(PathBuf::from(program), args.to_vec())))
            }
            (None, None) => None,
        };

        Ok(Self {
            tools: config.tool_set(),
            files: FileManager::new(config.output_root.clone()),
            config,
            source,
            key_provider,
        })
    }

    pub fn with_key_provider(mut self, provider: Arc<dyn ContentKeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process every item, at most `max_concurrent_items` at a time
    ///
    /// One item's failure never stops the others.
    pub async fn run_batch(&self, session: &Session, items: Vec<ContentItem>) -> BatchReport {
        let semaphore = Semaphore::new(self.config.max_concurrent_items);
        tracing::info!(items = items.len(), workers = self.config.max_concurrent_items, "batch started");

        let runs = items.into_iter().map(|item| {
            let semaphore = &semaphore;
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => self.process_item(session, &item).await,
                    Err(e) => Err(LiberatorError::internal(format!("worker pool closed: {}", e))),
                };
                (item, result)
            }
        });

        let mut report = BatchReport::default();
        for (item, result) in futures_util::future::join_all(runs).await {
            match result {
                Ok(output) => report.succeeded.push(output),
                Err(error) => {
                    tracing::error!(
                        title_id = item.title_id,
                        kind = %item.kind,
                        title = %item.title,
                        category = error.category(),
                        error = %error,
                        "item failed"
                    );
                    report.failed.push(ItemFailure { item, error });
                }
            }
        }

        tracing::info!("{}", report.summary());
        report
    }

    /// Run one item in its own scratch directory
    pub async fn process_item(&self, session: &Session, item: &ContentItem) -> Result<ItemOutput> {
        let span = tracing::info_span!("item", title_id = item.title_id, kind = %item.kind);
        async {
            tracing::info!(title = %item.title, "processing");

            let scratch = ScratchSpace::prepare(&self.config.scratch_root, &scratch_name(item)).await?;
            let result = self.run_item(session, item, &scratch).await;

            if let Err(e) = scratch.cleanup(self.config.retain_policy()).await {
                tracing::warn!(error = %e, "scratch cleanup failed");
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn run_item(&self, session: &Session, item: &ContentItem, scratch: &ScratchSpace) -> Result<ItemOutput> {
        let (item, tree) = match item.kind {
            ContentKind::Ebook | ContentKind::Comic => {
                let tree = self.decrypt_archive(session, item, scratch).await?;
                (item.clone(), tree)
            }
            ContentKind::Audiobook => {
                let item = self.with_chapters(session, item).await;
                let tree = self.fetch_audiobook(session, &item, scratch).await?;
                (item, tree)
            }
        };

        let assembler = ContentAssembler::for_kind(item.kind, &self.tools);
        let archive = assembler.assemble(&tree, &item, &scratch.staging_dir()).await?;
        if archive.fallback {
            tracing::warn!(output = %archive.relative.display(), "whole decrypted tree archived");
        }

        self.promote(item, archive).await
    }

    async fn promote(&self, item: ContentItem, archive: OutputArchive) -> Result<ItemOutput> {
        let path = self.files.promote(&archive.staged, &archive.relative).await?;

        let mut companions = Vec::new();
        for (staged, relative) in &archive.companions {
            match self.files.promote(staged, relative).await {
                Ok(path) => companions.push(path),
                Err(e) => tracing::warn!(file = %relative.display(), error = %e, "companion file not promoted"),
            }
        }

        Ok(ItemOutput {
            item,
            path,
            companions,
            fallback: archive.fallback,
        })
    }

    /// Fetch (or reuse), unwrap the file key and decrypt every entry
    async fn decrypt_archive(&self, session: &Session, item: &ContentItem, scratch: &ScratchSpace) -> Result<DecryptedTree> {
        let encrypted_root = match &self.config.use_existing_download {
            Some(existing) => {
                if !existing.is_dir() {
                    return Err(LiberatorError::FileNotFound(existing.display().to_string()));
                }
                tracing::info!(path = %existing.display(), "using existing download");
                existing.clone()
            }
            None => {
                let zip_path = scratch.path().join(format!("{}.zip", item.circ_id));
                self.source.download_archive(session, item, &zip_path).await?;

                let encrypted_root = scratch.encrypted_dir();
                let target = encrypted_root.clone();
                let zip = zip_path.clone();
                let entries = tokio::task::spawn_blocking(move || extract_archive(&zip, &target)).await??;
                tokio::fs::remove_file(&zip_path)
                    .await
                    .map_err(|e| LiberatorError::file_io("remove_file", &zip_path, e))?;
                tracing::debug!(entries, "archive extracted");
                encrypted_root
            }
        };

        let wrapped = self.source.wrapped_key(session, item).await?;
        let file_key = wrapped.unwrap_key()?;
        let cipher = StreamCipher::new(file_key, &item.media_key, self.config.iv_scheme)
            .with_chunk_size(self.config.chunk_size);

        let decrypted_root = scratch.decrypted_dir().join(tree_dir_name(item));
        decrypt_tree(Arc::new(cipher), &encrypted_root, &decrypted_root).await
    }

    /// Chapters only come with the detailed title record
    async fn with_chapters(&self, session: &Session, item: &ContentItem) -> ContentItem {
        match self.source.title_details(session, item.title_id).await {
            Ok(details) => match item.with_details(&details) {
                Ok(merged) => merged,
                Err(e) => {
                    tracing::warn!(error = %e, "title details unusable, continuing without them");
                    item.clone()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "title details unavailable, continuing without chapters");
                item.clone()
            }
        }
    }

    async fn fetch_audiobook(&self, session: &Session, item: &ContentItem, scratch: &ScratchSpace) -> Result<DecryptedTree> {
        if self.config.use_existing_download.is_some() {
            tracing::warn!("existing downloads only apply to e-books and comics, fetching the stream");
        }

        let provider = self.key_provider.as_ref().ok_or_else(|| {
            LiberatorError::InvalidConfiguration("audiobooks need a content key or key command".to_string())
        })?;

        let fetcher = SegmentedFetcher::new(
            self.tools.downloader.clone(),
            self.tools.decryptor.clone(),
            self.tools.ffmpeg.clone(),
        );
        fetcher.check_tools().await?;

        let url = manifest_url(&item.media_key);
        let mpd = self.source.fetch_text(&url).await?;
        let pssh = extract_pssh(&mpd)?;
        let auth_token = self.source.playback_token(session, item).await?;

        let key = provider
            .content_key(&KeyRequest {
                pssh,
                license_url: LICENSE_URL.to_string(),
                auth_token,
            })
            .await?;

        let untagged = fetcher.fetch(&url, &key, &scratch.encrypted_dir()).await?;

        let tree_root = scratch.decrypted_dir().join(tree_dir_name(item));
        tokio::fs::create_dir_all(&tree_root)
            .await
            .map_err(|e| LiberatorError::file_io("create_dir", &tree_root, e))?;
        let target = tree_root.join(UNTAGGED_FILE);
        tokio::fs::rename(&untagged, &target)
            .await
            .map_err(|e| LiberatorError::file_io("rename", &untagged, e))?;

        self.fetch_cover(&small_cover_url(&item.media_key), &tree_root.join(SMALL_COVER_FILE))
            .await;
        self.fetch_cover(&large_cover_url(&item.media_key), &tree_root.join(LARGE_COVER_FILE))
            .await;

        Ok(DecryptedTree::from_existing(tree_root))
    }

    /// Covers are optional; failures leave no file behind
    async fn fetch_cover(&self, url: &str, destination: &Path) {
        if let Err(e) = self.source.download_file(url, destination).await {
            tracing::warn!(url, error = %e, "cover download failed");
            let _ = tokio::fs::remove_file(destination).await;
        }
    }
}

/// `<kind>-<circ id>-<YYYYmmddHHMMSS>`
pub fn scratch_name(item: &ContentItem) -> String {
    format!("{}-{}-{}", item.kind, item.circ_id, Local::now().format("%Y%m%d%H%M%S"))
}

/// Decrypted tree directory; also names whole-tree fallback archives
fn tree_dir_name(item: &ContentItem) -> String {
    let name = sanitize_filename(item.title.trim());
    if name.is_empty() {
        item.title_id.to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{comic_record, ebook_record, FakeSource, PATRON_ID};
    use super::*;
    use crate::config::ToolPaths;
    use std::fs::File;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::builder()
            .output_root(dir.path().join("out"))
            .scratch_root(dir.path().join("scratch"))
            .max_concurrent_items(2)
            .build()
            .unwrap()
    }

    fn session() -> Session {
        Session::new("token", 7, PATRON_ID)
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_scratch_name() {
        let item = ContentItem::from_record(&comic_record(3, "mk-3", "Saga", None)).unwrap();
        let name = scratch_name(&item);
        assert!(name.starts_with("comic-3003-"));
        assert_eq!(name.len(), "comic-3003-".len() + 14);
    }

    #[tokio::test]
    async fn test_comic_item_end_to_end() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_archive(
            "mk-1",
            &[("01.jpg", b"sixteen byte pg!".as_slice()), ("02.png", b"page two"), ("info.txt", b"")],
        );

        let liberator = Liberator::new(config(&dir), Arc::new(source)).unwrap();
        let item = ContentItem::from_record(&comic_record(1, "mk-1", "Saga", Some("Vol. 1"))).unwrap();
        let output = liberator.process_item(&session(), &item).await.unwrap();

        assert_eq!(output.path, dir.path().join("out").join("Saga, Vol. 1.cbz"));
        assert_eq!(entry_names(&output.path), vec!["01.jpg", "02.png"]);

        let mut archive = zip::ZipArchive::new(File::open(&output.path).unwrap()).unwrap();
        let mut page = archive.by_name("01.jpg").unwrap();
        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut page, &mut body).unwrap();
        assert_eq!(body, b"sixteen byte pg!");

        let scratch_entries = std::fs::read_dir(dir.path().join("scratch")).unwrap().count();
        assert_eq!(scratch_entries, 0);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_archive("mk-1", &[("a.jpg", b"a".as_slice())]);
        // mk-2 has no archive: its download fails

        let liberator = Liberator::new(config(&dir), Arc::new(source)).unwrap();
        let items = vec![
            ContentItem::from_record(&comic_record(1, "mk-1", "Good", None)).unwrap(),
            ContentItem::from_record(&comic_record(2, "mk-2", "Bad", None)).unwrap(),
        ];
        let report = liberator.run_batch(&session(), items).await;

        assert_eq!(report.total(), 2);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item.title_id, 2);
        assert!(!report.is_success());
        assert!(dir.path().join("out/Good.cbz").exists());
        assert!(!dir.path().join("out/Bad.cbz").exists());
    }

    #[tokio::test]
    async fn test_ebook_item_end_to_end() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_archive(
            "mk-5",
            &[
                ("mimetype", b"application/epub+zip".as_slice()),
                (
                    "META-INF/container.xml",
                    br#"<?xml version="1.0"?><container xmlns="urn:oasis:names:tc:opendocument:xmlns:container"><rootfiles><rootfile full-path="content.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#,
                ),
                (
                    "content.opf",
                    br#"<?xml version="1.0"?><package xmlns="http://www.idpf.org/2007/opf" xmlns:dc="http://purl.org/dc/elements/1.1/"><metadata><dc:title>Tea</dc:title><dc:creator>Okakura</dc:creator></metadata><manifest><item id="c1" href="ch1.xhtml"/></manifest></package>"#,
                ),
                ("ch1.xhtml", b"<html/>"),
                ("junk.bin", b"leftover"),
            ],
        );

        let liberator = Liberator::new(config(&dir), Arc::new(source)).unwrap();
        let item = ContentItem::from_record(&ebook_record(5, "mk-5", "Tea")).unwrap();
        let output = liberator.process_item(&session(), &item).await.unwrap();

        assert_eq!(output.path, dir.path().join("out/Tea - Okakura.epub"));
        assert!(!output.fallback);
        assert_eq!(
            entry_names(&output.path),
            vec!["META-INF/container.xml", "ch1.xhtml", "content.opf", "mimetype"]
        );
    }

    #[tokio::test]
    async fn test_keep_decrypted_retains_tree() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        source.add_archive("mk-1", &[("a.jpg", b"a".as_slice())]);

        let mut config = config(&dir);
        config.keep_decrypted = true;
        let liberator = Liberator::new(config, Arc::new(source)).unwrap();
        let item = ContentItem::from_record(&comic_record(1, "mk-1", "Kept", None)).unwrap();
        liberator.process_item(&session(), &item).await.unwrap();

        let scratch: Vec<PathBuf> = std::fs::read_dir(dir.path().join("scratch"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(scratch.len(), 1);
        assert!(scratch[0].join("decrypted/Kept/a.jpg").exists());
        assert!(!scratch[0].join("encrypted").exists());
    }

    #[tokio::test]
    async fn test_audiobook_without_key_provider_fails() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(dir.path());
        let liberator = Liberator::new(config(&dir), Arc::new(source)).unwrap();

        let mut item = ContentItem::from_record(&comic_record(9, "mk-9", "Heard", None)).unwrap();
        item.kind = ContentKind::Audiobook;
        let result = liberator.process_item(&session(), &item).await;
        assert!(matches!(result, Err(LiberatorError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_audiobook_with_missing_tools_fails_before_fetching() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.content_key = Some("0123456789abcdef0123456789abcdef:fedcba9876543210fedcba9876543210".to_string());
        config.tools = ToolPaths {
            ffmpeg: dir.path().join("bin/ffmpeg"),
            yt_dlp: dir.path().join("bin/yt-dlp"),
            mp4decrypt: dir.path().join("bin/mp4decrypt"),
            epub_zip: None,
        };
        let liberator = Liberator::new(config, Arc::new(FakeSource::new(dir.path()))).unwrap();

        let mut item = ContentItem::from_record(&comic_record(10, "mk-10", "Spoken", None)).unwrap();
        item.kind = ContentKind::Audiobook;
        let result = liberator.process_item(&session(), &item).await;
        assert!(matches!(result, Err(LiberatorError::ExternalToolNotFound(_))));
        assert!(std::fs::read_dir(dir.path().join("out")).map(|mut d| d.next().is_none()).unwrap_or(true));
    }

    #[test]
    fn test_key_provider_from_config() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(&dir);
        bad.content_key = Some("not-a-key".to_string());
        assert!(Liberator::new(bad, Arc::new(FakeSource::new(dir.path()))).is_err());
    }
}
