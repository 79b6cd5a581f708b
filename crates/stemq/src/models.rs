use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::StoreError;
use crate::sanitize::sanitize_filename;

/// Extension of every file produced by separation
pub const OUTPUT_EXTENSION: &str = "mp3";

/// Status of a background job.
///
/// Persisted as the integer codes `QUEUED=0, IN_PROGRESS=1, DONE=2, ERROR=-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum JobStatus {
    Queued,
    InProgress,
    Done,
    Error,
}

impl JobStatus {
    pub fn code(self) -> i8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::InProgress => 1,
            JobStatus::Done => 2,
            JobStatus::Error => -1,
        }
    }

    /// QUEUED -> IN_PROGRESS -> DONE | ERROR, plus IN_PROGRESS -> QUEUED for the stale sweep
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Done)
                | (JobStatus::InProgress, JobStatus::Error)
                | (JobStatus::InProgress, JobStatus::Queued)
        )
    }

    /// Queued or in progress
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

impl From<JobStatus> for i8 {
    fn from(status: JobStatus) -> i8 {
        status.code()
    }
}

impl TryFrom<i8> for JobStatus {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, String> {
        match code {
            0 => Ok(JobStatus::Queued),
            1 => Ok(JobStatus::InProgress),
            2 => Ok(JobStatus::Done),
            -1 => Ok(JobStatus::Error),
            other => Err(format!("unknown job status code {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "Queued",
            JobStatus::InProgress => "In Progress",
            JobStatus::Done => "Done",
            JobStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

/// MP3 bitrate of produced files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Bitrate {
    Kbps192,
    Kbps256,
    Kbps320,
}

impl Bitrate {
    pub fn kbps(self) -> u32 {
        match self {
            Bitrate::Kbps192 => 192,
            Bitrate::Kbps256 => 256,
            Bitrate::Kbps320 => 320,
        }
    }
}

impl From<Bitrate> for u32 {
    fn from(bitrate: Bitrate) -> u32 {
        bitrate.kbps()
    }
}

impl TryFrom<u32> for Bitrate {
    type Error = String;

    fn try_from(kbps: u32) -> Result<Self, Self::Error> {
        match kbps {
            192 => Ok(Bitrate::Kbps192),
            256 => Ok(Bitrate::Kbps256),
            320 => Ok(Bitrate::Kbps320),
            other => Err(format!("unsupported bitrate {} (expected 192, 256 or 320)", other)),
        }
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kbps())
    }
}

/// One isolated musical component of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemPart {
    Vocals,
    Piano,
    Drums,
    Bass,
    Other,
}

impl StemPart {
    /// Order in which a dynamic mix verifies, renames and uploads its stems
    pub const DYNAMIC_ORDER: [StemPart; 5] = [
        StemPart::Vocals,
        StemPart::Piano,
        StemPart::Other,
        StemPart::Bass,
        StemPart::Drums,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StemPart::Vocals => "vocals",
            StemPart::Piano => "piano",
            StemPart::Drums => "drums",
            StemPart::Bass => "bass",
            StemPart::Other => "other",
        }
    }

    /// File name the separator writes for a full split, e.g. `vocals.mp3`
    pub fn raw_filename(self) -> String {
        format!("{}.{}", self.as_str(), OUTPUT_EXTENSION)
    }
}

impl fmt::Display for StemPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StemPart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vocals" => Ok(StemPart::Vocals),
            "piano" => Ok(StemPart::Piano),
            "drums" => Ok(StemPart::Drums),
            "bass" => Ok(StemPart::Bass),
            "other" | "accompaniment" => Ok(StemPart::Other),
            other => Err(format!("unknown stem part: {}", other)),
        }
    }
}

/// Which stems a static mix keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSelection {
    pub vocals: bool,
    pub piano: bool,
    pub drums: bool,
    pub bass: bool,
    pub other: bool,
}

impl PartSelection {
    pub fn from_parts(parts: &[StemPart]) -> Self {
        let mut selection = PartSelection::default();
        for part in parts {
            match part {
                StemPart::Vocals => selection.vocals = true,
                StemPart::Piano => selection.piano = true,
                StemPart::Drums => selection.drums = true,
                StemPart::Bass => selection.bass = true,
                StemPart::Other => selection.other = true,
            }
        }
        selection
    }

    /// Selected parts in naming order: vocals, piano, drums, bass, other
    pub fn selected(&self) -> Vec<StemPart> {
        [
            (self.vocals, StemPart::Vocals),
            (self.piano, StemPart::Piano),
            (self.drums, StemPart::Drums),
            (self.bass, StemPart::Bass),
            (self.other, StemPart::Other),
        ]
        .into_iter()
        .filter_map(|(on, part)| on.then_some(part))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selected().is_empty()
    }
}

/// Options understood by the separation capability.
///
/// Unknown keys are rejected on deserialization so nothing unvalidated
/// reaches the separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeparatorArgs {
    /// Number of random time shifts averaged by the model (0 = none)
    pub random_shifts: u8,
    /// Force (`true`) or forbid (`false`) CPU separation; `None` follows the service default
    pub cpu_only: Option<bool>,
    /// Process the input in chunks of this many seconds
    pub segment_secs: Option<u32>,
}

impl SeparatorArgs {
    /// `cpu` or `gpu`
    pub fn device(&self, cpu_by_default: bool) -> &'static str {
        if self.cpu_only.unwrap_or(cpu_by_default) {
            "cpu"
        } else {
            "gpu"
        }
    }
}

/// Class of a separation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Static,
    Dynamic,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Static => f.write_str("static"),
            JobKind::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Lifecycle fields shared by every background job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    /// Handle of the execution bound to this record by the dispatcher
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub error: String,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Queued,
            execution_id: None,
            error: String::new(),
            date_created: now,
            date_started: None,
            date_finished: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    /// QUEUED -> IN_PROGRESS, binding the execution handle
    pub fn claim(&mut self, execution_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.transition(JobStatus::InProgress)?;
        self.execution_id = Some(execution_id);
        self.date_started = Some(now);
        Ok(())
    }

    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.transition(JobStatus::Done)?;
        self.date_finished = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.transition(JobStatus::Error)?;
        self.error = message.into();
        self.date_finished = Some(now);
        Ok(())
    }

    /// IN_PROGRESS -> QUEUED for an abandoned run
    pub fn requeue(&mut self) -> Result<(), StoreError> {
        self.transition(JobStatus::Queued)?;
        self.execution_id = None;
        self.date_started = None;
        self.error.clear();
        Ok(())
    }
}

/// Audio asset uploaded by a user or imported from YouTube
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: Uuid,
    /// Local file, relative to the media root
    pub file: Option<PathBuf>,
    pub file_url: Option<String>,
    pub public_id: Option<String>,
    pub duration: Option<f64>,
    pub filename: Option<String>,
    pub is_youtube: bool,
    pub youtube_link: Option<String>,
    pub youtube_fetch_task: Option<Uuid>,
}

impl SourceFile {
    /// File already hosted in remote storage
    pub fn from_url(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file: None,
            file_url: Some(url.into()),
            public_id: None,
            duration: None,
            filename: Some(filename.into()),
            is_youtube: false,
            youtube_link: None,
            youtube_fetch_task: None,
        }
    }

    /// File stored under the media root
    pub fn from_local(relative_path: impl Into<PathBuf>) -> Self {
        let file: PathBuf = relative_path.into();
        let filename = file.file_name().map(|n| n.to_string_lossy().into_owned());
        Self {
            id: Uuid::new_v4(),
            file: Some(file),
            file_url: None,
            public_id: None,
            duration: None,
            filename,
            is_youtube: false,
            youtube_link: None,
            youtube_fetch_task: None,
        }
    }

    /// File to be fetched from a YouTube link by the given task
    pub fn from_youtube(link: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            file: None,
            file_url: None,
            public_id: None,
            duration: None,
            filename: None,
            is_youtube: true,
            youtube_link: Some(link.into()),
            youtube_fetch_task: Some(task_id),
        }
    }

    /// Where the audio can be fetched from: the remote URL, else the local file
    pub fn origin(&self, media_root: &Path) -> Option<String> {
        if let Some(url) = self.file_url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        self.file
            .as_ref()
            .map(|f| media_root.join(f).to_string_lossy().into_owned())
    }

    /// Name to store the fetched copy under
    pub fn local_name(&self) -> String {
        let name = self
            .filename
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_default();
        if name.is_empty() || name.chars().all(|c| c == '.') {
            format!("source.{}", OUTPUT_EXTENSION)
        } else {
            name
        }
    }
}

/// A song: a source file plus user-entered metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTrack {
    pub id: Uuid,
    pub source_file: Uuid,
    pub artist: String,
    pub title: String,
    pub thumb: Option<String>,
    pub tone: Option<String>,
    pub bpm: Option<String>,
    pub bar_length: Option<String>,
    pub chords: Option<String>,
    pub notes: Option<String>,
    pub date_created: DateTime<Utc>,
}

impl SourceTrack {
    pub fn new(source_file: Uuid, artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_file,
            artist: artist.into(),
            title: title.into(),
            thumb: None,
            tone: None,
            bpm: None,
            bar_length: None,
            chords: None,
            notes: None,
            date_created: Utc::now(),
        }
    }
}

impl fmt::Display for SourceTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.artist, self.title)
    }
}

/// Asynchronous YouTube audio fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YtDownloadTask {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: JobState,
}

impl YtDownloadTask {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::new(Utc::now()),
        }
    }
}

impl Default for YtDownloadTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniqueness tuple of a static mix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticMixKey {
    pub source_track: Uuid,
    pub separator: String,
    pub separator_args: SeparatorArgs,
    pub bitrate: Bitrate,
    pub parts: PartSelection,
}

/// Job producing one file with a chosen subset of stems mixed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticMix {
    pub id: Uuid,
    pub source_track: Uuid,
    pub separator: String,
    pub separator_args: SeparatorArgs,
    pub bitrate: Bitrate,
    #[serde(flatten)]
    pub parts: PartSelection,
    #[serde(flatten)]
    pub state: JobState,
    pub file_url: Option<String>,
    pub public_id: Option<String>,
    pub duration: Option<f64>,
    pub filename: Option<String>,
}

impl StaticMix {
    pub fn new(
        source_track: Uuid,
        separator: impl Into<String>,
        separator_args: SeparatorArgs,
        bitrate: Bitrate,
        parts: PartSelection,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_track,
            separator: separator.into(),
            separator_args,
            bitrate,
            parts,
            state: JobState::new(Utc::now()),
            file_url: None,
            public_id: None,
            duration: None,
            filename: None,
        }
    }

    pub fn unique_key(&self) -> StaticMixKey {
        StaticMixKey {
            source_track: self.source_track,
            separator: self.separator.clone(),
            separator_args: self.separator_args.clone(),
            bitrate: self.bitrate,
            parts: self.parts,
        }
    }

    /// `<artist>-<title>_<parts>__<bitrate>kbps_<separator>_`
    pub fn formatted_name(&self, track: &SourceTrack) -> String {
        let parts: Vec<&str> = self.parts.selected().into_iter().map(StemPart::as_str).collect();
        format!(
            "{}-{}_{}__{}kbps_{}_",
            track.artist,
            track.title,
            parts.join("_"),
            self.bitrate,
            self.separator
        )
    }

    /// Sanitized output file name, also the last segment of the remote key
    pub fn output_filename(&self, track: &SourceTrack) -> String {
        format!("{}.{}", sanitize_filename(&self.formatted_name(track)), OUTPUT_EXTENSION)
    }
}

/// Remote copy of one stem of a dynamic mix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StemAsset {
    pub url: Option<String>,
    pub public_id: Option<String>,
    pub duration: Option<f64>,
}

impl StemAsset {
    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Uniqueness tuple of a dynamic mix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicMixKey {
    pub source_track: Uuid,
    pub separator: String,
    pub separator_args: SeparatorArgs,
    pub bitrate: Bitrate,
}

/// Job producing all five stems as separate files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicMix {
    pub id: Uuid,
    pub source_track: Uuid,
    pub separator: String,
    pub separator_args: SeparatorArgs,
    pub bitrate: Bitrate,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(default)]
    pub vocals: StemAsset,
    #[serde(default)]
    pub piano: StemAsset,
    #[serde(default)]
    pub other: StemAsset,
    #[serde(default)]
    pub bass: StemAsset,
    #[serde(default)]
    pub drums: StemAsset,
}

impl DynamicMix {
    pub fn new(
        source_track: Uuid,
        separator: impl Into<String>,
        separator_args: SeparatorArgs,
        bitrate: Bitrate,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_track,
            separator: separator.into(),
            separator_args,
            bitrate,
            state: JobState::new(Utc::now()),
            vocals: StemAsset::default(),
            piano: StemAsset::default(),
            other: StemAsset::default(),
            bass: StemAsset::default(),
            drums: StemAsset::default(),
        }
    }

    pub fn unique_key(&self) -> DynamicMixKey {
        DynamicMixKey {
            source_track: self.source_track,
            separator: self.separator.clone(),
            separator_args: self.separator_args.clone(),
            bitrate: self.bitrate,
        }
    }

    pub fn stem(&self, part: StemPart) -> &StemAsset {
        match part {
            StemPart::Vocals => &self.vocals,
            StemPart::Piano => &self.piano,
            StemPart::Other => &self.other,
            StemPart::Bass => &self.bass,
            StemPart::Drums => &self.drums,
        }
    }

    pub fn stem_mut(&mut self, part: StemPart) -> &mut StemAsset {
        match part {
            StemPart::Vocals => &mut self.vocals,
            StemPart::Piano => &mut self.piano,
            StemPart::Other => &mut self.other,
            StemPart::Bass => &mut self.bass,
            StemPart::Drums => &mut self.drums,
        }
    }

    pub fn has_any_url(&self) -> bool {
        StemPart::DYNAMIC_ORDER.iter().any(|p| self.stem(*p).has_url())
    }

    /// Sanitized `<artist>-<title>`
    pub fn file_prefix(&self, track: &SourceTrack) -> String {
        sanitize_filename(&format!("{}-{}", track.artist, track.title))
    }

    /// Sanitized `(<bitrate>kbps_<separator>)`
    pub fn file_suffix(&self) -> String {
        sanitize_filename(&format!("({}kbps_{})", self.bitrate, self.separator))
    }

    /// `<prefix>_<stem>_<suffix>.mp3`
    pub fn stem_filename(prefix: &str, part: StemPart, suffix: &str) -> String {
        format!("{}_{}_{}.{}", prefix, part, suffix, OUTPUT_EXTENSION)
    }
}
