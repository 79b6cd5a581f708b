use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Local directories owned by the service.
///
/// Every job gets `<separate_root>/<job id>/` with an `upload/` subdirectory
/// for the fetched source. Locally stored source files live under
/// `<upload_root>/<source file id>/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    media_root: PathBuf,
    separate_root: PathBuf,
    upload_root: PathBuf,
}

impl Workspace {
    pub fn new(media_root: PathBuf, separate_root: PathBuf, upload_root: PathBuf) -> Self {
        Self { media_root, separate_root, upload_root }
    }

    pub fn from_config(config: &crate::config::ServiceConfig) -> Self {
        Self::new(config.media_root.clone(), config.separate_root(), config.upload_root())
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn separate_root(&self) -> &Path {
        &self.separate_root
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.separate_root.join(job_id.to_string())
    }

    pub fn job_upload_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("upload")
    }

    pub fn source_file_dir(&self, file_id: Uuid) -> PathBuf {
        self.upload_root.join(file_id.to_string())
    }

    /// Resolve a path stored relative to the media root
    pub fn media_path(&self, relative: &Path) -> PathBuf {
        self.media_root.join(relative)
    }

    /// Start a job from a clean directory: anything left by an earlier attempt
    /// is removed, then `<job>/upload/` is created.
    pub async fn prepare(&self, job_id: Uuid) -> Result<PathBuf> {
        let job_dir = self.job_dir(job_id);
        remove_dir_if_exists(&job_dir)
            .await
            .with_context(|| format!("Failed to clear job directory: {}", job_dir.display()))?;

        let upload_dir = self.job_upload_dir(job_id);
        tokio::fs::create_dir_all(&upload_dir)
            .await
            .with_context(|| format!("Failed to create job directory: {}", upload_dir.display()))?;
        Ok(job_dir)
    }

    /// Remove a job directory, logging instead of failing
    pub async fn remove_job_dir(&self, job_id: Uuid) {
        remove_dir_best_effort(&self.job_dir(job_id)).await;
    }

    /// Names of every directory directly under the separate root
    pub async fn list_job_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let root = self.separate_root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, PathBuf)>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut dirs = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
                if entry.file_type().is_dir() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    dirs.push((name, entry.into_path()));
                }
            }
            Ok(dirs)
        })
        .await
        .context("Workspace listing task panicked")?
    }
}

/// Paths among `paths` that do not exist
pub async fn missing_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    for path in paths {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            missing.push(path.clone());
        }
    }
    missing
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn remove_dir_best_effort(path: &Path) {
    match remove_dir_if_exists(path).await {
        Ok(()) => debug!("Removed directory {}", path.display()),
        Err(e) => warn!("Failed to remove directory {}: {}", path.display(), e),
    }
}

pub async fn remove_file_best_effort(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove file {}: {}", path.display(), e),
    }
}
