//! Test doubles for the external capabilities and a ready-made environment.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use crate::config::ServiceConfig;
use crate::fetch::SourceFetcher;
use crate::models::{SourceFile, SourceTrack, StemPart};
use crate::pipeline::PipelineContext;
use crate::reconcile::Reconciler;
use crate::separator::{SeparationOptions, Separator};
use crate::storage::{public_id_for_key, RemoteStorage, UploadedAsset};
use crate::store::JobStore;

/// Serve exactly one canned HTTP response; returns a URL on the server
pub async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status_line,
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{}/song.mp3", addr)
}

/// Insert a URL-backed source file and a track on it
pub fn seed_track(store: &JobStore, url: &str) -> (SourceFile, SourceTrack) {
    let file = SourceFile::from_url(url, "song.mp3");
    let track = SourceTrack::new(file.id, "Artist", "Title");
    store.insert_source_file(file.clone()).unwrap();
    store.insert_source_track(track.clone()).unwrap();
    (file, track)
}

/// Separator that writes placeholder files
pub struct FakeSeparator {
    /// Stems written by `split_all`
    stems: Vec<StemPart>,
    /// Whether `split_selected` writes its output
    write_selected: bool,
    error: Option<String>,
    delay: Option<Duration>,
    selected_calls: Mutex<Vec<Vec<StemPart>>>,
}

impl Default for FakeSeparator {
    fn default() -> Self {
        Self {
            stems: StemPart::DYNAMIC_ORDER.to_vec(),
            write_selected: true,
            error: None,
            delay: None,
            selected_calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSeparator {
    pub fn writing(stems: &[StemPart]) -> Self {
        Self { stems: stems.to_vec(), ..Default::default() }
    }

    /// Reports success without writing anything
    pub fn silent() -> Self {
        Self { stems: Vec::new(), write_selected: false, ..Default::default() }
    }

    pub fn failing(message: &str) -> Self {
        Self { error: Some(message.to_string()), ..Default::default() }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn selected_calls(&self) -> Vec<Vec<StemPart>> {
        self.selected_calls.lock().unwrap().clone()
    }

    async fn begin(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn split_all(&self, _input: &Path, output_dir: &Path, _options: &SeparationOptions) -> Result<()> {
        self.begin().await?;
        for part in &self.stems {
            tokio::fs::write(output_dir.join(part.raw_filename()), part.as_str()).await?;
        }
        Ok(())
    }

    async fn split_selected(
        &self,
        parts: &[StemPart],
        _input: &Path,
        output: &Path,
        _options: &SeparationOptions,
    ) -> Result<()> {
        self.selected_calls.lock().unwrap().push(parts.to_vec());
        self.begin().await?;
        if self.write_selected {
            tokio::fs::write(output, b"mix").await?;
        }
        Ok(())
    }
}

/// Storage that remembers what it was asked to do
#[derive(Default)]
pub struct MemoryStorage {
    uploads: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    fail_uploads_matching: Mutex<Option<String>>,
    fail_deletes: AtomicBool,
}

impl MemoryStorage {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    /// Reject uploads whose key contains `pattern`
    pub fn fail_uploads_matching(&self, pattern: &str) {
        *self.fail_uploads_matching.lock().unwrap() = Some(pattern.to_string());
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<UploadedAsset> {
        tokio::fs::metadata(local_path).await?;
        if let Some(pattern) = self.fail_uploads_matching.lock().unwrap().as_deref() {
            if remote_key.contains(pattern) {
                anyhow::bail!("storage rejected {}", remote_key);
            }
        }
        self.uploads.lock().unwrap().push(remote_key.to_string());
        Ok(UploadedAsset {
            secure_url: format!("https://cdn.test/{}", remote_key),
            public_id: public_id_for_key(remote_key).to_string(),
            duration: 180.5,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(public_id.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("storage unreachable");
        }
        Ok(())
    }
}

/// Fetcher that writes a fixed payload, or fails
#[derive(Default)]
pub struct FakeFetcher {
    error: Option<String>,
}

impl FakeFetcher {
    pub fn failing(message: &str) -> Self {
        Self { error: Some(message.to_string()) }
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn download(&self, dest: &Path, _source: &str) -> Result<()> {
        if let Some(message) = &self.error {
            anyhow::bail!("{}", message);
        }
        tokio::fs::write(dest, b"source audio").await?;
        Ok(())
    }
}

/// Store, fakes and config rooted in a temporary directory
pub struct Harness {
    pub dir: TempDir,
    pub config: ServiceConfig,
    pub store: Arc<JobStore>,
    pub separator: Arc<FakeSeparator>,
    pub storage: Arc<MemoryStorage>,
    pub fetcher: Arc<FakeFetcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeSeparator::default(), FakeFetcher::default())
    }

    pub fn with(separator: FakeSeparator, fetcher: FakeFetcher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default_config();
        config.media_root = dir.path().join("media");
        config.store_dir = dir.path().join("state");
        let store = Arc::new(JobStore::open(&config.store_dir).unwrap());
        Self {
            dir,
            config,
            store,
            separator: Arc::new(separator),
            storage: Arc::new(MemoryStorage::default()),
            fetcher: Arc::new(fetcher),
        }
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.separator.clone(),
            self.storage.clone(),
            self.fetcher.clone(),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(&self.config, Arc::clone(&self.store), self.storage.clone())
    }

    /// Track on its own URL-backed source file
    pub fn track(&self, artist: &str, title: &str) -> SourceTrack {
        let file = SourceFile::from_url(format!("https://cdn.test/uploads/{}.mp3", uuid::Uuid::new_v4()), "song.mp3");
        let track = SourceTrack::new(file.id, artist, title);
        self.store.insert_source_file(file).unwrap();
        self.store.insert_source_track(track.clone()).unwrap();
        track
    }
}
