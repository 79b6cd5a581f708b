use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;

/// Retrieves source audio into the job workspace
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Write the audio found at `source` (URL or local path) to `dest`
    async fn download(&self, dest: &Path, source: &str) -> Result<()>;
}

/// Fetches `http(s)://` URLs over the network and everything else from disk
pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build fetch HTTP client")?;
        Ok(Self { http_client })
    }

    async fn download_http(&self, dest: &Path, url: &str) -> Result<()> {
        let mut response = self
            .http_client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "HTTP {} {} for {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                url
            );
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Download of {} interrupted", url))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("Failed to move download into {}", dest.display()))?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

/// `<dest>.part`
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn is_http(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn download(&self, dest: &Path, source: &str) -> Result<()> {
        if is_http(source) {
            let result = self.download_http(dest, source).await;
            if result.is_err() {
                let _ = tokio::fs::remove_file(part_path(dest)).await;
            }
            return result;
        }

        let local = source.strip_prefix("file://").unwrap_or(source);
        tokio::fs::copy(local, dest)
            .await
            .with_context(|| format!("No such file: {}", local))?;
        debug!("Copied {} into {}", local, dest.display());
        Ok(())
    }
}
