pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod recovery;
pub mod requests;
pub mod sanitize;
pub mod separator;
pub mod storage;
pub mod store;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServiceConfig;
pub use dispatcher::Dispatcher;
pub use error::{JobError, ReconcileError, StoreError, SubmitError};
pub use models::{Bitrate, DynamicMix, JobKind, JobStatus, SourceFile, SourceTrack, StaticMix, StemPart, YtDownloadTask};
pub use pipeline::{MixJob, Outcome, PipelineContext};
pub use reconcile::Reconciler;
pub use recovery::Recovery;
pub use store::JobStore;
