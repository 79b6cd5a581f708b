//! Creating sources and queueing jobs.

use std::path::{Path, PathBuf};
use log::info;
use uuid::Uuid;
use crate::config::ServiceConfig;
use crate::error::{StoreError, SubmitError};
use crate::models::{
    Bitrate, DynamicMix, JobStatus, PartSelection, SeparatorArgs, SourceFile, SourceTrack,
    StaticMix, StemPart, YtDownloadTask,
};
use crate::reconcile::Reconciler;
use crate::sanitize::sanitize_filename;
use crate::store::JobStore;

/// Request for a single file with the chosen stems mixed together
#[derive(Debug, Clone, Default)]
pub struct StaticMixRequest {
    pub source_track: Uuid,
    pub parts: Vec<StemPart>,
    /// Falls back to `default_separator`
    pub separator: Option<String>,
    pub separator_args: SeparatorArgs,
    /// Falls back to `default_bitrate`
    pub bitrate: Option<Bitrate>,
}

/// Request for all five stems as separate files
#[derive(Debug, Clone, Default)]
pub struct DynamicMixRequest {
    pub source_track: Uuid,
    pub separator: Option<String>,
    pub separator_args: SeparatorArgs,
    pub bitrate: Option<Bitrate>,
}

/// Where imported audio comes from
#[derive(Debug, Clone)]
pub enum SourceInput {
    /// Already hosted remotely
    Url(String),
    /// A file on this machine, copied under the upload root
    Local(PathBuf),
}

/// Song metadata entered alongside an import
#[derive(Debug, Clone, Default)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub tone: Option<String>,
    pub bpm: Option<String>,
    pub bar_length: Option<String>,
    pub chords: Option<String>,
    pub notes: Option<String>,
}

/// Queue a static mix. An identical existing job is replaced when
/// `overwrite` is set or it ended in ERROR; otherwise it is reported back.
/// A job that is still running is never replaced.
pub async fn submit_static_mix(
    config: &ServiceConfig,
    store: &JobStore,
    reconciler: &Reconciler,
    request: StaticMixRequest,
    overwrite: bool,
) -> Result<StaticMix, SubmitError> {
    if store.get::<SourceTrack>(request.source_track).is_none() {
        return Err(SubmitError::UnknownTrack(request.source_track));
    }
    let parts = PartSelection::from_parts(&request.parts);
    if parts.is_empty() {
        return Err(SubmitError::NoPartsSelected);
    }

    let mix = StaticMix::new(
        request.source_track,
        request.separator.unwrap_or_else(|| config.default_separator.clone()),
        request.separator_args,
        request.bitrate.unwrap_or(config.default_bitrate),
        parts,
    );

    if let Some(existing) = store.find_static_mix(&mix.unique_key()) {
        if existing.state.status == JobStatus::InProgress {
            return Err(SubmitError::Running(existing.id));
        }
        if !(overwrite || existing.state.status == JobStatus::Error) {
            return Err(SubmitError::Duplicate(existing.id));
        }
        info!("Replacing static mix {} ({})", existing.id, existing.state.status);
        reconciler.delete_static_mix(existing.id).await?;
    }

    store.insert_static_mix(mix.clone())?;
    info!("📝 Queued static mix {}", mix.id);
    Ok(mix)
}

/// Queue a dynamic mix, with the same replacement rules as static mixes
pub async fn submit_dynamic_mix(
    config: &ServiceConfig,
    store: &JobStore,
    reconciler: &Reconciler,
    request: DynamicMixRequest,
    overwrite: bool,
) -> Result<DynamicMix, SubmitError> {
    if store.get::<SourceTrack>(request.source_track).is_none() {
        return Err(SubmitError::UnknownTrack(request.source_track));
    }

    let mix = DynamicMix::new(
        request.source_track,
        request.separator.unwrap_or_else(|| config.default_separator.clone()),
        request.separator_args,
        request.bitrate.unwrap_or(config.default_bitrate),
    );

    if let Some(existing) = store.find_dynamic_mix(&mix.unique_key()) {
        if existing.state.status == JobStatus::InProgress {
            return Err(SubmitError::Running(existing.id));
        }
        if !(overwrite || existing.state.status == JobStatus::Error) {
            return Err(SubmitError::Duplicate(existing.id));
        }
        info!("Replacing dynamic mix {} ({})", existing.id, existing.state.status);
        reconciler.delete_dynamic_mix(existing.id).await?;
    }

    store.insert_dynamic_mix(mix.clone())?;
    info!("📝 Queued dynamic mix {}", mix.id);
    Ok(mix)
}

/// Create a source file and a track on it. Local files are copied to
/// `<upload_root>/<file id>/`.
pub async fn import_source(
    config: &ServiceConfig,
    store: &JobStore,
    input: SourceInput,
    info: TrackInfo,
) -> Result<(SourceFile, SourceTrack), SubmitError> {
    let file = match input {
        SourceInput::Url(url) => {
            let filename = url
                .rsplit('/')
                .next()
                .map(|n| n.split(['?', '#']).next().unwrap_or(n).to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "source.mp3".to_string());
            SourceFile::from_url(url, filename)
        }
        SourceInput::Local(path) => {
            let id = Uuid::new_v4();
            let relative = copy_into_uploads(config, id, &path).await?;
            let mut file = SourceFile::from_local(relative);
            file.id = id;
            file
        }
    };

    let mut track = SourceTrack::new(file.id, info.artist, info.title);
    track.tone = info.tone;
    track.bpm = info.bpm;
    track.bar_length = info.bar_length;
    track.chords = info.chords;
    track.notes = info.notes;

    store.insert_source_file(file.clone())?;
    store.insert_source_track(track.clone())?;
    info!("📥 Imported {} as track {}", track, track.id);
    Ok((file, track))
}

/// `<upload_dir>/<id>/<sanitized name>`, relative to the media root
async fn copy_into_uploads(config: &ServiceConfig, id: Uuid, path: &Path) -> Result<PathBuf, SubmitError> {
    let name = path
        .file_name()
        .map(|n| sanitize_filename(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "source.mp3".to_string());
    let relative = Path::new(&config.upload_dir).join(id.to_string()).join(name);
    let target = config.media_root.join(&relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(path, &target).await?;
    Ok(relative)
}

/// Register a YouTube link: a source file plus the queued fetch task for it
pub fn register_youtube_source(store: &JobStore, link: &str) -> Result<(YtDownloadTask, SourceFile), SubmitError> {
    let link = link.trim();
    if let Some(existing) = store
        .filter::<SourceFile>(|f| f.youtube_link.as_deref() == Some(link))
        .into_iter()
        .next()
    {
        return Err(SubmitError::Store(StoreError::Duplicate {
            table: "source_files",
            detail: format!("youtube link already registered as {}", existing.id),
        }));
    }

    let task = YtDownloadTask::new();
    store.insert_yt_task(task.clone())?;
    let file = SourceFile::from_youtube(link, task.id);
    if let Err(e) = store.insert_source_file(file.clone()) {
        store.remove::<YtDownloadTask>(task.id)?;
        return Err(e.into());
    }
    info!("📺 Registered YouTube source {} (task {})", link, task.id);
    Ok((task, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use chrono::Utc;
    use crate::dispatcher::Dispatcher;
    use crate::models::JobKind;
    use crate::pipeline::Outcome;
    use crate::testing::{FakeFetcher, FakeSeparator, Harness};

    fn static_request(track: Uuid, parts: &[StemPart]) -> StaticMixRequest {
        StaticMixRequest { source_track: track, parts: parts.to_vec(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_static_defaults_come_from_config() {
        let h = Harness::new();
        let track = h.track("Artist", "Title");
        let mix = submit_static_mix(&h.config, &h.store, &h.reconciler(), static_request(track.id, &[StemPart::Vocals]), false)
            .await
            .unwrap();
        assert_eq!(mix.separator, "spleeter");
        assert_eq!(mix.bitrate, Bitrate::Kbps256);
        assert_eq!(mix.state.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_static_requires_parts_and_track() {
        let h = Harness::new();
        let track = h.track("Artist", "Title");
        let err = submit_static_mix(&h.config, &h.store, &h.reconciler(), static_request(track.id, &[]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NoPartsSelected));

        let ghost = Uuid::new_v4();
        let err = submit_static_mix(&h.config, &h.store, &h.reconciler(), static_request(ghost, &[StemPart::Bass]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownTrack(id) if id == ghost));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_unless_overwrite_or_error() {
        let h = Harness::new();
        let rec = h.reconciler();
        let track = h.track("Artist", "Title");
        let request = static_request(track.id, &[StemPart::Vocals]);

        let first = submit_static_mix(&h.config, &h.store, &rec, request.clone(), false).await.unwrap();
        let err = submit_static_mix(&h.config, &h.store, &rec, request.clone(), false).await.unwrap_err();
        assert!(matches!(err, SubmitError::Duplicate(id) if id == first.id));

        let second = submit_static_mix(&h.config, &h.store, &rec, request.clone(), true).await.unwrap();
        assert!(h.store.get::<StaticMix>(first.id).is_none());

        // A failed predecessor is replaced without asking
        h.store.claim_next_of(JobKind::Static, Uuid::new_v4(), Utc::now()).unwrap();
        h.store.update::<StaticMix, _>(second.id, |m| m.state.fail("boom", Utc::now())).unwrap();
        let third = submit_static_mix(&h.config, &h.store, &rec, request, false).await.unwrap();
        assert!(h.store.get::<StaticMix>(second.id).is_none());
        assert_eq!(h.store.all::<StaticMix>().len(), 1);
        assert_eq!(h.store.all::<StaticMix>()[0].id, third.id);
    }

    #[tokio::test]
    async fn test_overwrite_refused_while_predecessor_runs() {
        let h = Harness::with(FakeSeparator::default().delayed(Duration::from_millis(300)), FakeFetcher::default());
        let rec = h.reconciler();
        let track = h.track("Artist", "Title");
        let request = static_request(track.id, &[StemPart::Vocals]);
        let first = submit_static_mix(&h.config, &h.store, &rec, request.clone(), false).await.unwrap();

        let ctx = Arc::new(h.context());
        let job = Dispatcher::new(Arc::clone(&ctx)).tick(JobKind::Static).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = submit_static_mix(&h.config, &h.store, &rec, request, true).await.unwrap_err();
        assert!(matches!(err, SubmitError::Running(id) if id == first.id));
        assert_eq!(h.store.all::<StaticMix>().len(), 1);

        assert_eq!(job.await.unwrap(), Outcome::Done);
        assert_eq!(h.store.require::<StaticMix>(first.id).unwrap().state.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_dynamic_overwrite_refused_while_running() {
        let h = Harness::new();
        let rec = h.reconciler();
        let track = h.track("Artist", "Title");
        let request = DynamicMixRequest { source_track: track.id, ..Default::default() };
        let first = submit_dynamic_mix(&h.config, &h.store, &rec, request.clone(), false).await.unwrap();
        h.store.claim_next_of(JobKind::Dynamic, Uuid::new_v4(), Utc::now()).unwrap();

        let err = submit_dynamic_mix(&h.config, &h.store, &rec, request, true).await.unwrap_err();
        assert!(matches!(err, SubmitError::Running(id) if id == first.id));
        assert!(h.store.get::<DynamicMix>(first.id).is_some());
    }

    #[tokio::test]
    async fn test_dynamic_overwrite_deletes_predecessor_stems() {
        let h = Harness::new();
        let rec = h.reconciler();
        let track = h.track("Artist", "Title");
        let request = DynamicMixRequest { source_track: track.id, bitrate: Some(Bitrate::Kbps320), ..Default::default() };

        let first = submit_dynamic_mix(&h.config, &h.store, &rec, request.clone(), false).await.unwrap();
        h.store
            .update::<DynamicMix, _>(first.id, |m| {
                m.vocals.url = Some("https://cdn.test/v.mp3".to_string());
                m.vocals.public_id = Some("dynamic/a/v".to_string());
                Ok(())
            })
            .unwrap();

        submit_dynamic_mix(&h.config, &h.store, &rec, request, true).await.unwrap();
        assert_eq!(h.storage.deletes(), vec!["dynamic/a/v".to_string()]);
    }

    #[tokio::test]
    async fn test_import_local_file_copies_into_uploads() {
        let h = Harness::new();
        let src = h.dir.path().join("My Song.MP3");
        std::fs::write(&src, b"audio").unwrap();

        let (file, track) = import_source(
            &h.config,
            &h.store,
            SourceInput::Local(src),
            TrackInfo { artist: "A".into(), title: "B".into(), bpm: Some("120".into()), ..Default::default() },
        )
        .await
        .unwrap();

        let relative = file.file.clone().unwrap();
        assert_eq!(relative, Path::new("uploads").join(file.id.to_string()).join("my_song.mp3"));
        assert_eq!(std::fs::read(h.config.media_root.join(&relative)).unwrap(), b"audio");
        assert_eq!(track.bpm.as_deref(), Some("120"));
        assert_eq!(h.store.require::<SourceTrack>(track.id).unwrap().source_file, file.id);
    }

    #[tokio::test]
    async fn test_import_url_keeps_remote_name() {
        let h = Harness::new();
        let (file, _) = import_source(
            &h.config,
            &h.store,
            SourceInput::Url("https://cdn.test/a/song.mp3?sig=1".into()),
            TrackInfo { artist: "A".into(), title: "B".into(), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(file.filename.as_deref(), Some("song.mp3"));
        assert!(file.file.is_none());
    }

    #[test]
    fn test_youtube_link_registered_once() {
        let h = Harness::new();
        let (task, file) = register_youtube_source(&h.store, "https://youtu.be/abc").unwrap();
        assert_eq!(file.youtube_fetch_task, Some(task.id));
        assert_eq!(task.state.status, JobStatus::Queued);

        assert!(register_youtube_source(&h.store, "https://youtu.be/abc").is_err());
        assert_eq!(h.store.all::<YtDownloadTask>().len(), 1);
    }
}
