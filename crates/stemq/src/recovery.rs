use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use uuid::Uuid;
use crate::config::ServiceConfig;
use crate::error::StoreError;
use crate::models::{DynamicMix, JobStatus, StaticMix};
use crate::store::{JobRecord, JobStore};
use crate::workspace::{remove_dir_best_effort, Workspace};

/// What one recovery pass changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    pub requeued: Vec<Uuid>,
    pub removed_dirs: Vec<PathBuf>,
}

/// Puts abandoned jobs back in the queue and reaps leftover workspaces
pub struct Recovery {
    store: Arc<JobStore>,
    workspace: Workspace,
    stale_age: chrono::Duration,
}

impl Recovery {
    pub fn new(config: &ServiceConfig, store: Arc<JobStore>) -> Self {
        Self {
            store,
            workspace: Workspace::from_config(config),
            stale_age: config.stale_job_age(),
        }
    }

    /// Requeue IN_PROGRESS mixes started before `now - stale_job_secs` (or
    /// with no start time) and remove their workspaces
    pub async fn recover_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = now - self.stale_age;
        let mut requeued = self.requeue_stale::<StaticMix>(cutoff)?;
        requeued.extend(self.requeue_stale::<DynamicMix>(cutoff)?);

        for id in &requeued {
            self.workspace.remove_job_dir(*id).await;
        }
        if !requeued.is_empty() {
            info!("🔄 Requeued {} stale job(s)", requeued.len());
        }
        Ok(requeued)
    }

    fn requeue_stale<T: JobRecord>(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let is_stale = |state: &crate::models::JobState| {
            state.status == JobStatus::InProgress && state.date_started.map_or(true, |t| t < cutoff)
        };

        let mut requeued = Vec::new();
        for candidate in self.store.filter::<T>(|r| is_stale(r.state())) {
            let id = candidate.id();
            // Re-checked under the store lock; the job may have finished meanwhile.
            let mut changed = false;
            self.store.update::<T, _>(id, |r| {
                if is_stale(r.state()) {
                    r.state_mut().requeue()?;
                    changed = true;
                }
                Ok(())
            })?;
            if changed {
                warn!("Job {}: ♻️  Stuck in progress since {:?}, reset to queued", id, candidate.state().date_started);
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    /// Remove workspace directories that do not belong to a queued or running job
    pub async fn cleanup_orphaned_workspaces(&self) -> Result<Vec<PathBuf>> {
        let mut active: HashSet<Uuid> = HashSet::new();
        active.extend(self.store.filter::<StaticMix>(|m| m.state.status.is_active()).into_iter().map(|m| m.id));
        active.extend(self.store.filter::<DynamicMix>(|m| m.state.status.is_active()).into_iter().map(|m| m.id));

        let mut removed = Vec::new();
        for (name, path) in self.workspace.list_job_dirs().await? {
            let owned = Uuid::parse_str(&name).map(|id| active.contains(&id)).unwrap_or(false);
            if !owned {
                info!("🧹 Removing orphaned workspace {}", path.display());
                remove_dir_best_effort(&path).await;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Stale sweep followed by orphan cleanup
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let requeued = self.recover_stale_jobs(now).await?;
        let removed_dirs = self.cleanup_orphaned_workspaces().await?;
        Ok(RecoveryReport { requeued, removed_dirs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bitrate, JobKind, SeparatorArgs};
    use crate::testing::Harness;

    fn recovery(h: &Harness) -> Recovery {
        Recovery::new(&h.config, Arc::clone(&h.store))
    }

    fn running_dynamic(h: &Harness, started: DateTime<Utc>) -> Uuid {
        let track = h.track("Artist", "Title");
        let mix = DynamicMix::new(track.id, "demo", SeparatorArgs::default(), Bitrate::Kbps256);
        let id = mix.id;
        h.store.insert_dynamic_mix(mix).unwrap();
        h.store.claim_next_of(JobKind::Dynamic, Uuid::new_v4(), started).unwrap();
        id
    }

    #[tokio::test]
    async fn test_stale_job_is_requeued_and_dir_removed() {
        let h = Harness::new();
        let now = Utc::now();
        let id = running_dynamic(&h, now - chrono::Duration::hours(3));
        let ws = h.context().workspace;
        ws.prepare(id).await.unwrap();

        let requeued = recovery(&h).recover_stale_jobs(now).await.unwrap();
        assert_eq!(requeued, vec![id]);

        let mix = h.store.require::<DynamicMix>(id).unwrap();
        assert_eq!(mix.state.status, JobStatus::Queued);
        assert!(mix.state.execution_id.is_none());
        assert!(mix.state.date_started.is_none());
        assert!(!ws.job_dir(id).exists());
    }

    #[tokio::test]
    async fn test_recent_job_is_left_running() {
        let h = Harness::new();
        let now = Utc::now();
        let id = running_dynamic(&h, now - chrono::Duration::minutes(10));

        assert!(recovery(&h).recover_stale_jobs(now).await.unwrap().is_empty());
        assert_eq!(h.store.require::<DynamicMix>(id).unwrap().state.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_orphaned_dirs_removed_active_kept() {
        let h = Harness::new();
        let ws = h.context().workspace;
        let active = running_dynamic(&h, Utc::now());
        ws.prepare(active).await.unwrap();
        let orphan = Uuid::new_v4();
        ws.prepare(orphan).await.unwrap();
        std::fs::create_dir_all(ws.separate_root().join("not-a-job")).unwrap();

        let removed = recovery(&h).cleanup_orphaned_workspaces().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(ws.job_dir(active).exists());
        assert!(!ws.job_dir(orphan).exists());
    }

    #[tokio::test]
    async fn test_run_once_without_workspace_root() {
        let h = Harness::new();
        let report = recovery(&h).run_once(Utc::now()).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
