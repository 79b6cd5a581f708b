//! File-backed record store.
//!
//! Every record lives in `<dir>/<table>/<id>.json` and the files are the only
//! copy: every read goes to disk, so records written by another process (the
//! CLI next to a running daemon) are seen straight away. Mutations hold the
//! store lock (an in-process mutex plus a `.lock` file in the store directory)
//! for one read-modify-write. Record files are replaced atomically
//! (temp file + rename).

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;
use crate::error::StoreError;
use crate::models::{
    DynamicMix, DynamicMixKey, JobKind, JobState, SourceFile, SourceTrack, StaticMix,
    StaticMixKey, YtDownloadTask,
};

const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(5);
/// A lock file older than this was left by a process that died mid-write
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Snapshot of every table as read from disk
#[derive(Debug, Default)]
pub struct Tables {
    source_files: BTreeMap<Uuid, SourceFile>,
    source_tracks: BTreeMap<Uuid, SourceTrack>,
    yt_tasks: BTreeMap<Uuid, YtDownloadTask>,
    static_mixes: BTreeMap<Uuid, StaticMix>,
    dynamic_mixes: BTreeMap<Uuid, DynamicMix>,
}

/// A persisted record type
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Table (and directory) name
    const TABLE: &'static str;

    fn id(&self) -> Uuid;
    fn table(tables: &Tables) -> &BTreeMap<Uuid, Self>;
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Uuid, Self>;
}

/// A record driven through the job status machine
pub trait JobRecord: Record {
    fn state(&self) -> &JobState;
    fn state_mut(&mut self) -> &mut JobState;
}

macro_rules! impl_record {
    ($ty:ty, $table:literal, $field:ident) => {
        impl Record for $ty {
            const TABLE: &'static str = $table;

            fn id(&self) -> Uuid {
                self.id
            }

            fn table(tables: &Tables) -> &BTreeMap<Uuid, Self> {
                &tables.$field
            }

            fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Uuid, Self> {
                &mut tables.$field
            }
        }
    };
}

macro_rules! impl_job_record {
    ($ty:ty) => {
        impl JobRecord for $ty {
            fn state(&self) -> &JobState {
                &self.state
            }

            fn state_mut(&mut self) -> &mut JobState {
                &mut self.state
            }
        }
    };
}

impl_record!(SourceFile, "source_files", source_files);
impl_record!(SourceTrack, "source_tracks", source_tracks);
impl_record!(YtDownloadTask, "yt_tasks", yt_tasks);
impl_record!(StaticMix, "static_mixes", static_mixes);
impl_record!(DynamicMix, "dynamic_mixes", dynamic_mixes);
impl_job_record!(YtDownloadTask);
impl_job_record!(StaticMix);
impl_job_record!(DynamicMix);

const TABLES: &[&str] = &[
    SourceFile::TABLE,
    SourceTrack::TABLE,
    YtDownloadTask::TABLE,
    StaticMix::TABLE,
    DynamicMix::TABLE,
];

/// Exclusive hold on the store directory. Dropping it removes the lock file
/// before the in-process mutex is released.
struct StoreLock<'a> {
    path: PathBuf,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release store lock {}: {}", self.path.display(), e);
        }
    }
}

/// Persistent home of files, tracks and jobs
pub struct JobStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl JobStore {
    /// Open (or create) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        for table in TABLES {
            fs::create_dir_all(dir.join(table))?;
        }

        let store = Self { dir, guard: Mutex::new(()) };
        let tables = store.snapshot();
        debug!(
            "Opened record store {}: {} files, {} tracks, {} static, {} dynamic",
            store.dir.display(),
            tables.source_files.len(),
            tables.source_tracks.len(),
            tables.static_mixes.len(),
            tables.dynamic_mixes.len()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the in-process mutex, then the lock file shared with other
    /// processes using the same directory
    fn lock(&self) -> Result<StoreLock<'_>, StoreError> {
        // Nothing guarded by the mutex survives a panic, so poisoning is moot.
        let guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = self.dir.join(LOCK_FILE);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid is informational only.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(StoreLock { path, _guard: guard });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("Breaking stale store lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn record_path<T: Record>(&self, id: Uuid) -> PathBuf {
        self.dir.join(T::TABLE).join(format!("{}.json", id))
    }

    fn persist<T: Record>(&self, record: &T) -> Result<(), StoreError> {
        let path = self.record_path::<T>(record.id());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn unlink<T: Record>(&self, id: Uuid) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path::<T>(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one record file; a missing file is `None`
    fn read<T: Record>(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        match fs::read(self.record_path::<T>(id)) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load<T: Record>(&self) -> BTreeMap<Uuid, T> {
        let mut tables = Tables::default();
        if let Err(e) = load_table::<T>(&self.dir, &mut tables) {
            warn!("Failed to read {} records: {}", T::TABLE, e);
        }
        std::mem::take(T::table_mut(&mut tables))
    }

    fn snapshot(&self) -> Tables {
        Tables {
            source_files: self.load(),
            source_tracks: self.load(),
            yt_tasks: self.load(),
            static_mixes: self.load(),
            dynamic_mixes: self.load(),
        }
    }

    pub fn get<T: Record>(&self, id: Uuid) -> Option<T> {
        match self.read(id) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read {} record {}: {}", T::TABLE, id, e);
                None
            }
        }
    }

    /// Like `get`, but a missing record is an error
    pub fn require<T: Record>(&self, id: Uuid) -> Result<T, StoreError> {
        self.read(id)?.ok_or(StoreError::NotFound { table: T::TABLE, id })
    }

    pub fn all<T: Record>(&self) -> Vec<T> {
        self.load::<T>().into_values().collect()
    }

    pub fn filter<T: Record>(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.load::<T>().into_values().filter(|r| pred(r)).collect()
    }

    /// Atomically modify one record. The closure sees the value currently on
    /// disk; if it fails, or the record was removed meanwhile, nothing is
    /// written.
    pub fn update<T, F>(&self, id: Uuid, f: F) -> Result<T, StoreError>
    where
        T: Record,
        F: FnOnce(&mut T) -> Result<(), StoreError>,
    {
        let _lock = self.lock()?;
        let mut record: T = self.read(id)?.ok_or(StoreError::NotFound { table: T::TABLE, id })?;
        f(&mut record)?;
        self.persist(&record)?;
        Ok(record)
    }

    /// Remove a record, returning it if it existed
    pub fn remove<T: Record>(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        let _lock = self.lock()?;
        let Some(record) = self.read::<T>(id)? else {
            return Ok(None);
        };
        self.unlink::<T>(id)?;
        Ok(Some(record))
    }

    fn insert_checked<T, F>(&self, record: T, check: F) -> Result<(), StoreError>
    where
        T: Record,
        F: FnOnce(&Tables) -> Result<(), StoreError>,
    {
        let _lock = self.lock()?;
        let tables = self.snapshot();
        if T::table(&tables).contains_key(&record.id()) {
            return Err(StoreError::Duplicate {
                table: T::TABLE,
                detail: format!("id {}", record.id()),
            });
        }
        check(&tables)?;
        self.persist(&record)
    }

    pub fn insert_source_file(&self, file: SourceFile) -> Result<(), StoreError> {
        self.insert_checked(file.clone(), |tables| {
            if let Some(link) = file.youtube_link.as_deref() {
                if tables.source_files.values().any(|f| f.youtube_link.as_deref() == Some(link)) {
                    return Err(StoreError::Duplicate {
                        table: SourceFile::TABLE,
                        detail: format!("youtube link {}", link),
                    });
                }
            }
            if let Some(task) = file.youtube_fetch_task {
                if !tables.yt_tasks.contains_key(&task) {
                    return Err(StoreError::NotFound { table: YtDownloadTask::TABLE, id: task });
                }
            }
            Ok(())
        })
    }

    pub fn insert_source_track(&self, track: SourceTrack) -> Result<(), StoreError> {
        let file = track.source_file;
        self.insert_checked(track, |tables| {
            if tables.source_files.contains_key(&file) {
                Ok(())
            } else {
                Err(StoreError::NotFound { table: SourceFile::TABLE, id: file })
            }
        })
    }

    pub fn insert_yt_task(&self, task: YtDownloadTask) -> Result<(), StoreError> {
        self.insert_checked(task, |_| Ok(()))
    }

    pub fn insert_static_mix(&self, mix: StaticMix) -> Result<(), StoreError> {
        let key = mix.unique_key();
        self.insert_checked(mix, |tables| {
            if !tables.source_tracks.contains_key(&key.source_track) {
                return Err(StoreError::NotFound { table: SourceTrack::TABLE, id: key.source_track });
            }
            if let Some(existing) = tables.static_mixes.values().find(|m| m.unique_key() == key) {
                return Err(StoreError::Duplicate {
                    table: StaticMix::TABLE,
                    detail: format!("same parameters as {}", existing.id),
                });
            }
            Ok(())
        })
    }

    pub fn insert_dynamic_mix(&self, mix: DynamicMix) -> Result<(), StoreError> {
        let key = mix.unique_key();
        self.insert_checked(mix, |tables| {
            if !tables.source_tracks.contains_key(&key.source_track) {
                return Err(StoreError::NotFound { table: SourceTrack::TABLE, id: key.source_track });
            }
            if let Some(existing) = tables.dynamic_mixes.values().find(|m| m.unique_key() == key) {
                return Err(StoreError::Duplicate {
                    table: DynamicMix::TABLE,
                    detail: format!("same parameters as {}", existing.id),
                });
            }
            Ok(())
        })
    }

    pub fn find_static_mix(&self, key: &StaticMixKey) -> Option<StaticMix> {
        self.load::<StaticMix>().into_values().find(|m| &m.unique_key() == key)
    }

    pub fn find_dynamic_mix(&self, key: &DynamicMixKey) -> Option<DynamicMix> {
        self.load::<DynamicMix>().into_values().find(|m| &m.unique_key() == key)
    }

    /// Claim the oldest queued record of a class: QUEUED -> IN_PROGRESS with the
    /// execution handle bound, under the store lock. The queue is read from
    /// disk on every call.
    pub fn claim_next<T: JobRecord>(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, StoreError> {
        let _lock = self.lock()?;
        let next = self
            .load::<T>()
            .into_values()
            .filter(|r| r.state().status == crate::models::JobStatus::Queued)
            .min_by_key(|r| (r.state().date_created, r.id()));

        let Some(mut record) = next else {
            return Ok(None);
        };

        record.state_mut().claim(execution_id, now)?;
        self.persist(&record)?;
        Ok(Some(record))
    }

    /// `claim_next` for a job class, returning the claimed id
    pub fn claim_next_of(
        &self,
        kind: JobKind,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(match kind {
            JobKind::Static => self.claim_next::<StaticMix>(execution_id, now)?.map(|m| m.id),
            JobKind::Dynamic => self.claim_next::<DynamicMix>(execution_id, now)?.map(|m| m.id),
        })
    }

    /// Tracks that still use `file`: same file id, or a file with the same
    /// origin URL
    pub fn tracks_referencing(&self, file: &SourceFile) -> Vec<SourceTrack> {
        let files = self.load::<SourceFile>();
        let url = file.file_url.as_deref().filter(|u| !u.is_empty());
        self.load::<SourceTrack>()
            .into_values()
            .filter(|t| {
                if t.source_file == file.id {
                    return true;
                }
                match url {
                    Some(url) => files.get(&t.source_file).and_then(|f| f.file_url.as_deref()) == Some(url),
                    None => false,
                }
            })
            .collect()
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

fn load_table<T: Record>(dir: &Path, tables: &mut Tables) -> Result<(), StoreError> {
    let table_dir = dir.join(T::TABLE);
    for entry in fs::read_dir(&table_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            // Leftover temp files from an interrupted write are ignored.
            continue;
        }
        let content = match fs::read(&path) {
            Ok(content) => content,
            // Removed between listing and reading
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<T>(&content) {
            Ok(record) => {
                T::table_mut(tables).insert(record.id(), record);
            }
            Err(e) => warn!("Skipping unreadable {} record {}: {}", T::TABLE, path.display(), e),
        }
    }
    Ok(())
}
