//! Per-job processing: fetch source, separate, verify, upload, record.
//!
//! Failures inside a run end the record in ERROR with the error text. A run
//! that hits the time limit is abandoned in place: no status change and no
//! cleanup, so it stays IN_PROGRESS until the stale sweep picks it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;
use crate::config::ServiceConfig;
use crate::error::JobError;
use crate::fetch::SourceFetcher;
use crate::models::{DynamicMix, JobKind, SourceFile, SourceTrack, StaticMix, StemPart};
use crate::separator::{SeparationOptions, Separator};
use crate::storage::{RemoteStorage, UploadedAsset};
use crate::store::JobStore;
use crate::workspace::{missing_files, remove_file_best_effort, Workspace};

/// Everything a pipeline run needs, built once and shared by all runs
pub struct PipelineContext {
    pub config: ServiceConfig,
    pub store: Arc<JobStore>,
    pub workspace: Workspace,
    pub separator: Arc<dyn Separator>,
    pub storage: Arc<dyn RemoteStorage>,
    pub fetcher: Arc<dyn SourceFetcher>,
    /// Hard limit for one run
    pub time_limit: Duration,
}

impl PipelineContext {
    pub fn new(
        config: ServiceConfig,
        store: Arc<JobStore>,
        separator: Arc<dyn Separator>,
        storage: Arc<dyn RemoteStorage>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            workspace: Workspace::from_config(&config),
            time_limit: config.job_time_limit(),
            config,
            store,
            separator,
            storage,
            fetcher,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    /// Record moved to ERROR with this text
    Failed(String),
    /// Time limit hit; record left IN_PROGRESS
    TimedOut,
}

/// A claimed job, ready to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixJob {
    Static(Uuid),
    Dynamic(Uuid),
}

impl MixJob {
    pub fn new(kind: JobKind, id: Uuid) -> Self {
        match kind {
            JobKind::Static => MixJob::Static(id),
            JobKind::Dynamic => MixJob::Dynamic(id),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            MixJob::Static(id) | MixJob::Dynamic(id) => *id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            MixJob::Static(_) => JobKind::Static,
            MixJob::Dynamic(_) => JobKind::Dynamic,
        }
    }

    /// Run the pipeline under the time limit and record the result
    pub async fn execute(self, ctx: &PipelineContext) -> Outcome {
        let id = self.id();
        info!("Job {}: 🚀 Starting {} mix", id, self.kind());

        let result = tokio::time::timeout(ctx.time_limit, async {
            match self {
                MixJob::Static(id) => run_static(ctx, id).await,
                MixJob::Dynamic(id) => run_dynamic(ctx, id).await,
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Job {}: ✅ {} mix done", id, self.kind());
                Outcome::Done
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                error!("Job {}: ❌ {}", id, message);
                self.record_failure(ctx, &message);
                Outcome::Failed(message)
            }
            Err(_) => {
                warn!(
                    "Job {}: ⏱️  Time limit of {}s exceeded, run aborted and left in progress",
                    id,
                    ctx.time_limit.as_secs()
                );
                Outcome::TimedOut
            }
        }
    }

    fn record_failure(&self, ctx: &PipelineContext, message: &str) {
        let now = Utc::now();
        let result = match self {
            MixJob::Static(id) => ctx
                .store
                .update::<StaticMix, _>(*id, |m| m.state.fail(message, now))
                .map(|_| ()),
            MixJob::Dynamic(id) => ctx
                .store
                .update::<DynamicMix, _>(*id, |m| m.state.fail(message, now))
                .map(|_| ()),
        };
        if let Err(e) = result {
            error!("Job {}: Failed to record error status: {}", self.id(), e);
        }
    }
}

/// Track and file behind a job, plus where to fetch the audio from
fn resolve_source(ctx: &PipelineContext, track_id: Uuid) -> Result<(SourceTrack, SourceFile, String), JobError> {
    let track = ctx
        .store
        .get::<SourceTrack>(track_id)
        .ok_or_else(|| JobError::MissingSource(format!("source track {} not found", track_id)))?;
    let file = ctx
        .store
        .get::<SourceFile>(track.source_file)
        .ok_or_else(|| JobError::MissingSource(format!("source file {} not found", track.source_file)))?;
    let origin = file
        .origin(ctx.workspace.media_root())
        .ok_or_else(|| JobError::MissingSource(format!("source file {} has no audio yet", file.id)))?;
    Ok((track, file, origin))
}

async fn prepare_and_fetch(
    ctx: &PipelineContext,
    job_id: Uuid,
    file: &SourceFile,
    origin: &str,
) -> Result<(PathBuf, PathBuf), JobError> {
    let job_dir = ctx
        .workspace
        .prepare(job_id)
        .await
        .map_err(|e| JobError::Write(format!("{:#}", e)))?;

    let source = ctx.workspace.job_upload_dir(job_id).join(file.local_name());
    info!("Job {}: 📥 Fetching {}", job_id, origin);
    ctx.fetcher
        .download(&source, origin)
        .await
        .map_err(|e| JobError::Fetch(format!("{:#}", e)))?;

    if !missing_files(std::slice::from_ref(&source)).await.is_empty() {
        return Err(JobError::Write(format!("source audio missing after fetch: {}", source.display())));
    }
    Ok((job_dir, source))
}

async fn upload(ctx: &PipelineContext, path: &Path, key: &str) -> Result<UploadedAsset, JobError> {
    ctx.storage.upload(path, key).await.map_err(|e| JobError::Upload {
        key: key.to_string(),
        message: format!("{:#}", e),
    })
}

async fn run_static(ctx: &PipelineContext, id: Uuid) -> Result<(), JobError> {
    let mix = ctx.store.require::<StaticMix>(id)?;
    let (track, file, origin) = resolve_source(ctx, mix.source_track)?;
    let (job_dir, source) = prepare_and_fetch(ctx, id, &file, &origin).await?;

    let filename = mix.output_filename(&track);
    let output = job_dir.join(&filename);
    let parts = mix.parts.selected();
    let options = SeparationOptions::new(&mix.separator, &mix.separator_args, mix.bitrate, ctx.config.cpu_separation);

    info!(
        "Job {}: 🎛️  Separating {} ({}) with {}",
        id,
        track,
        parts.iter().map(|p| p.as_str()).collect::<Vec<_>>().join("+"),
        mix.separator
    );
    ctx.separator
        .split_selected(&parts, &source, &output, &options)
        .await
        .map_err(|e| JobError::Capability(format!("{:#}", e)))?;

    if !missing_files(std::slice::from_ref(&output)).await.is_empty() {
        return Err(JobError::Write(format!("{} was not produced", output.display())));
    }

    let key = format!("static/{}", filename);
    let asset = upload(ctx, &output, &key).await?;

    let now = Utc::now();
    ctx.store.update::<StaticMix, _>(id, |m| {
        m.file_url = Some(asset.secure_url.clone());
        m.public_id = Some(asset.public_id.clone());
        m.duration = Some(asset.duration);
        m.filename = Some(filename.clone());
        m.state.finish(now)
    })?;

    remove_file_best_effort(&output).await;
    ctx.workspace.remove_job_dir(id).await;
    Ok(())
}

async fn run_dynamic(ctx: &PipelineContext, id: Uuid) -> Result<(), JobError> {
    let mix = ctx.store.require::<DynamicMix>(id)?;
    let (track, file, origin) = resolve_source(ctx, mix.source_track)?;
    let (job_dir, source) = prepare_and_fetch(ctx, id, &file, &origin).await?;

    let options = SeparationOptions::new(&mix.separator, &mix.separator_args, mix.bitrate, ctx.config.cpu_separation);
    info!("Job {}: 🎛️  Splitting {} into stems with {}", id, track, mix.separator);
    ctx.separator
        .split_all(&source, &job_dir, &options)
        .await
        .map_err(|e| JobError::Capability(format!("{:#}", e)))?;

    // All five stems or nothing gets uploaded.
    let raw: Vec<(StemPart, PathBuf)> = StemPart::DYNAMIC_ORDER
        .iter()
        .map(|part| (*part, job_dir.join(part.raw_filename())))
        .collect();
    let paths: Vec<PathBuf> = raw.iter().map(|(_, p)| p.clone()).collect();
    let missing = missing_files(&paths).await;
    if !missing.is_empty() {
        let names: Vec<String> = missing
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        return Err(JobError::Write(format!("missing stems: {}", names.join(", "))));
    }

    let prefix = mix.file_prefix(&track);
    let suffix = mix.file_suffix();
    let mut renamed = Vec::with_capacity(raw.len());
    for (part, path) in raw {
        let name = DynamicMix::stem_filename(&prefix, part, &suffix);
        let target = job_dir.join(&name);
        tokio::fs::rename(&path, &target)
            .await
            .map_err(|e| JobError::Write(format!("{}: {}", target.display(), e)))?;
        renamed.push((part, target, name));
    }

    // Each stem is recorded as soon as it is uploaded; a later failure keeps the earlier ones.
    for (part, path, name) in renamed {
        let key = format!("dynamic/{}/{}", prefix, name);
        let asset = upload(ctx, &path, &key).await?;
        ctx.store.update::<DynamicMix, _>(id, |m| {
            let stem = m.stem_mut(part);
            stem.url = Some(asset.secure_url.clone());
            stem.public_id = Some(asset.public_id.clone());
            stem.duration = Some(asset.duration);
            Ok(())
        })?;
    }

    let now = Utc::now();
    ctx.store.update::<DynamicMix, _>(id, |m| m.state.finish(now))?;
    ctx.workspace.remove_job_dir(id).await;
    Ok(())
}
