use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use crate::config::StorageConfig;

/// What remote storage reports for an uploaded file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadedAsset {
    pub secure_url: String,
    pub public_id: String,
    #[serde(default)]
    pub duration: f64,
}

/// Remote object storage for produced files
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Upload `local_path` under `remote_key` (e.g. `static/name.mp3`)
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<UploadedAsset>;

    /// Delete an object by its public id. Deleting an object that does not exist succeeds.
    async fn delete(&self, public_id: &str) -> Result<()>;
}

/// Remote key without its extension, used as the object's public id
pub fn public_id_for_key(remote_key: &str) -> &str {
    match remote_key.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => stem,
        _ => remote_key,
    }
}

/// Storage API client speaking multipart upload / REST delete
pub struct HttpStorage {
    http_client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build storage HTTP client")?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn asset_url(&self, public_id: &str) -> String {
        format!("{}/assets/{}", self.endpoint, public_id)
    }
}

#[async_trait]
impl RemoteStorage for HttpStorage {
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<UploadedAsset> {
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {} for upload", local_path.display()))?;
        let file_name = remote_key.rsplit('/').next().unwrap_or(remote_key).to_string();

        debug!("Uploading {} ({} bytes) as {}", local_path.display(), data.len(), remote_key);

        let form = reqwest::multipart::Form::new()
            .text("public_id", public_id_for_key(remote_key).to_string())
            .text("resource_type", "video")
            .part("file", reqwest::multipart::Part::bytes(data).file_name(file_name));

        let response = self
            .authorize(self.http_client.post(format!("{}/upload", self.endpoint)))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Upload request for {} failed", remote_key))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, body.trim());
        }

        let asset = response
            .json::<UploadedAsset>()
            .await
            .with_context(|| format!("Invalid upload response for {}", remote_key))?;
        info!("☁️  Uploaded {} -> {}", remote_key, asset.secure_url);
        Ok(asset)
    }

    async fn delete(&self, public_id: &str) -> Result<()> {
        let response = self
            .authorize(self.http_client.delete(self.asset_url(public_id)))
            .send()
            .await
            .with_context(|| format!("Delete request for {} failed", public_id))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("Remote object {} already gone", public_id);
            return Ok(());
        }
        if !status.is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            );
        }
        info!("🗑️  Deleted remote object {}", public_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_id_strips_extension() {
        assert_eq!(public_id_for_key("static/a_b.mp3"), "static/a_b");
        assert_eq!(
            public_id_for_key("dynamic/x/x_vocals_(256kbps_demo).mp3"),
            "dynamic/x/x_vocals_(256kbps_demo)"
        );
        assert_eq!(public_id_for_key("dynamic/v1.2/noext"), "dynamic/v1.2/noext");
        assert_eq!(public_id_for_key(".mp3"), ".mp3");
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let storage = HttpStorage::new(&StorageConfig {
            endpoint: "https://cdn.example/api/".to_string(),
            token: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(storage.asset_url("static/x"), "https://cdn.example/api/assets/static/x");
    }

    #[test]
    fn test_upload_response_duration_optional() {
        let asset: UploadedAsset =
            serde_json::from_str(r#"{"secure_url": "https://cdn/x.mp3", "public_id": "static/x"}"#).unwrap();
        assert_eq!(asset.duration, 0.0);
    }
}
