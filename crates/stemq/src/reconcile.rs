//! Deletion with side effects.
//!
//! Each delete keeps local directories, remote objects and dependent records
//! in line with the record being removed. Side effects are best-effort: their
//! failures are logged and the record is removed regardless.

use std::io;
use std::path::Path;
use std::sync::Arc;
use log::{debug, info, warn};
use uuid::Uuid;
use crate::config::ServiceConfig;
use crate::error::{ReconcileError, StoreError};
use crate::models::{DynamicMix, SourceFile, SourceTrack, StaticMix, StemPart, YtDownloadTask};
use crate::storage::RemoteStorage;
use crate::store::JobStore;
use crate::workspace::Workspace;

pub struct Reconciler {
    store: Arc<JobStore>,
    storage: Arc<dyn RemoteStorage>,
    workspace: Workspace,
}

impl Reconciler {
    pub fn new(config: &ServiceConfig, store: Arc<JobStore>, storage: Arc<dyn RemoteStorage>) -> Self {
        Self {
            store,
            storage,
            workspace: Workspace::from_config(config),
        }
    }

    /// Delete a source file along with every track (and mix) built on it.
    /// Returns `false` if the file did not exist.
    pub async fn delete_source_file(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(file) = self.store.get::<SourceFile>(id) else {
            return Ok(false);
        };

        let dependents = self.store.filter::<SourceTrack>(|t| t.source_file == id);
        for track in dependents {
            self.remove_track_with_mixes(track.id).await?;
        }

        if let Some(relative) = &file.file {
            swallow(remove_path(&self.workspace.media_path(relative)).await);
        }
        swallow(remove_path(&self.workspace.source_file_dir(id)).await);

        if let Some(task) = file.youtube_fetch_task {
            self.store.remove::<YtDownloadTask>(task)?;
        }
        if let Some(public_id) = file.public_id.as_deref().filter(|p| !p.is_empty()) {
            self.delete_remote(public_id).await;
        }

        self.store.remove::<SourceFile>(id)?;
        info!("🗑️  Deleted source file {}", id);
        Ok(true)
    }

    /// Delete a track and its mixes, then the source file if nothing else uses it
    pub async fn delete_source_track(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(track) = self.store.get::<SourceTrack>(id) else {
            return Ok(false);
        };

        self.remove_track_with_mixes(id).await?;
        info!("🗑️  Deleted source track {} ({})", id, track);

        // Reference check runs only once the track itself is gone. Files that
        // share the origin URL count as one source, so each is checked.
        let Some(file) = self.store.get::<SourceFile>(track.source_file) else {
            return Ok(true);
        };
        let mut candidates = vec![file.clone()];
        if let Some(url) = file.file_url.as_deref().filter(|u| !u.is_empty()) {
            candidates.extend(
                self.store
                    .filter::<SourceFile>(|f| f.id != file.id && f.file_url.as_deref() == Some(url)),
            );
        }
        for candidate in candidates {
            let Some(current) = self.store.get::<SourceFile>(candidate.id) else {
                continue;
            };
            let remaining = self.store.tracks_referencing(&current);
            if remaining.is_empty() {
                debug!("Source file {} has no tracks left", current.id);
                self.delete_source_file(current.id).await?;
            } else {
                debug!("Source file {} still used by {} track(s)", current.id, remaining.len());
            }
        }
        Ok(true)
    }

    /// Delete a static mix. The remote file is kept while another static mix
    /// points at the same URL.
    pub async fn delete_static_mix(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(mix) = self.store.get::<StaticMix>(id) else {
            return Ok(false);
        };

        if let Some(url) = mix.file_url.as_deref().filter(|u| !u.is_empty()) {
            let shared = self
                .store
                .filter::<StaticMix>(|m| m.id != id && m.file_url.as_deref() == Some(url));
            if shared.is_empty() {
                if let Some(public_id) = mix.public_id.as_deref().filter(|p| !p.is_empty()) {
                    self.delete_remote(public_id).await;
                }
            } else {
                info!("Static mix {}: remote file shared with {} other mix(es), kept", id, shared.len());
            }
        }
        swallow(remove_path(&self.workspace.job_dir(id)).await);

        self.store.remove::<StaticMix>(id)?;
        info!("🗑️  Deleted static mix {}", id);
        Ok(true)
    }

    /// Delete a dynamic mix and every uploaded stem
    pub async fn delete_dynamic_mix(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(mix) = self.store.get::<DynamicMix>(id) else {
            return Ok(false);
        };

        if mix.has_any_url() {
            for part in StemPart::DYNAMIC_ORDER {
                if let Some(public_id) = mix.stem(part).public_id.as_deref().filter(|p| !p.is_empty()) {
                    self.delete_remote(public_id).await;
                }
            }
        }
        swallow(remove_path(&self.workspace.job_dir(id)).await);

        self.store.remove::<DynamicMix>(id)?;
        info!("🗑️  Deleted dynamic mix {}", id);
        Ok(true)
    }

    /// Delete a YouTube fetch task together with the file it was fetching
    pub async fn delete_yt_task(&self, id: Uuid) -> Result<bool, StoreError> {
        if self.store.get::<YtDownloadTask>(id).is_none() {
            return Ok(false);
        }

        let files = self.store.filter::<SourceFile>(|f| f.youtube_fetch_task == Some(id));
        for file in files {
            self.delete_source_file(file.id).await?;
        }
        self.store.remove::<YtDownloadTask>(id)?;
        info!("🗑️  Deleted YouTube fetch task {}", id);
        Ok(true)
    }

    /// Remove a track and its mixes without touching the source file
    async fn remove_track_with_mixes(&self, track_id: Uuid) -> Result<(), StoreError> {
        for mix in self.store.filter::<StaticMix>(|m| m.source_track == track_id) {
            self.delete_static_mix(mix.id).await?;
        }
        for mix in self.store.filter::<DynamicMix>(|m| m.source_track == track_id) {
            self.delete_dynamic_mix(mix.id).await?;
        }
        self.store.remove::<SourceTrack>(track_id)?;
        Ok(())
    }

    async fn delete_remote(&self, public_id: &str) {
        let result = self.storage.delete(public_id).await.map_err(|e| ReconcileError::RemoteDelete {
            public_id: public_id.to_string(),
            message: format!("{:#}", e),
        });
        swallow(result);
    }
}

/// Remove a file or directory tree; a missing path is fine
async fn remove_path(path: &Path) -> Result<(), ReconcileError> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn swallow(result: Result<(), ReconcileError>) {
    if let Err(e) = result {
        warn!("⚠️  {}", e);
    }
}
