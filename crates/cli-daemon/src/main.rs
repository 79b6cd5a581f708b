use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stemq::{
    audit,
    config::ServiceConfig,
    fetch::HttpFetcher,
    requests::{self, DynamicMixRequest, SourceInput, StaticMixRequest, TrackInfo},
    separator::CommandSeparator,
    storage::HttpStorage,
    Bitrate, Dispatcher, DynamicMix, JobStore, PipelineContext, Reconciler, Recovery, StaticMix,
    StemPart, SubmitError, YtDownloadTask,
};
use stemq::models::SeparatorArgs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

/// Stem separation job daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover stale jobs, then dispatch queued jobs until Ctrl-C
    Run,
    /// Register a source file and a track on it
    Import {
        /// Remote URL of the audio
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        url: Option<String>,
        /// Local audio file, copied under the upload directory
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        artist: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        bpm: Option<String>,
        #[arg(long)]
        tone: Option<String>,
    },
    /// Register a YouTube link to be fetched
    Youtube { link: String },
    /// Queue a static mix of the selected parts
    Static {
        #[arg(long)]
        track: Uuid,
        /// Comma-separated parts, e.g. vocals,drums
        #[arg(long, value_delimiter = ',', required = true)]
        parts: Vec<StemPart>,
        #[command(flatten)]
        options: MixOptions,
    },
    /// Queue a dynamic mix (all five stems)
    Dynamic {
        #[arg(long)]
        track: Uuid,
        #[command(flatten)]
        options: MixOptions,
    },
    /// List jobs
    List {
        /// Print one JSON record per line
        #[arg(long)]
        json: bool,
    },
    /// Delete a record and everything that depends on it
    Delete { target: DeleteTarget, id: Uuid },
    /// Run the stale job sweep and orphaned workspace cleanup once
    Recover,
    /// Check that every stored remote URL still resolves
    Audit,
}

#[derive(clap::Args, Debug)]
struct MixOptions {
    /// 192, 256 or 320
    #[arg(long, value_parser = parse_bitrate)]
    bitrate: Option<Bitrate>,
    /// Separation model
    #[arg(long)]
    separator: Option<String>,
    /// Random time shifts averaged by the model
    #[arg(long, default_value_t = 0)]
    shifts: u8,
    /// Force CPU separation
    #[arg(long, conflicts_with = "gpu")]
    cpu: bool,
    /// Force GPU separation
    #[arg(long)]
    gpu: bool,
    /// Process the input in chunks of this many seconds
    #[arg(long)]
    segment: Option<u32>,
    /// Replace an identical existing job
    #[arg(long)]
    overwrite: bool,
}

impl MixOptions {
    fn separator_args(&self) -> SeparatorArgs {
        let cpu_only = match (self.cpu, self.gpu) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        SeparatorArgs {
            random_shifts: self.shifts,
            cpu_only,
            segment_secs: self.segment,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeleteTarget {
    SourceFile,
    SourceTrack,
    Static,
    Dynamic,
    YtTask,
}

fn parse_bitrate(s: &str) -> Result<Bitrate, String> {
    let kbps: u32 = s.trim().parse().map_err(|_| format!("not a number: {}", s))?;
    Bitrate::try_from(kbps)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = ServiceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    let store = Arc::new(
        JobStore::open(&cfg.store_dir)
            .with_context(|| format!("Failed to open record store: {}", cfg.store_dir.display()))?,
    );

    match args.command {
        Command::Run => run_daemon(cfg, store).await,
        Command::Import { url, file, artist, title, bpm, tone } => {
            let input = match (url, file) {
                (Some(url), _) => SourceInput::Url(url),
                (None, Some(file)) => SourceInput::Local(file),
                (None, None) => anyhow::bail!("either --url or --file is required"),
            };
            let info = TrackInfo { artist, title, bpm, tone, ..Default::default() };
            let (file, track) = requests::import_source(&cfg, &store, input, info).await?;
            println!("source file {}", file.id);
            println!("source track {}", track.id);
            Ok(())
        }
        Command::Youtube { link } => {
            let (task, file) = requests::register_youtube_source(&store, &link)?;
            println!("source file {} (fetch task {})", file.id, task.id);
            Ok(())
        }
        Command::Static { track, parts, options } => {
            let reconciler = reconciler(&cfg, &store)?;
            let request = StaticMixRequest {
                source_track: track,
                parts,
                separator: options.separator.clone(),
                separator_args: options.separator_args(),
                bitrate: options.bitrate,
            };
            let result = requests::submit_static_mix(&cfg, &store, &reconciler, request, options.overwrite).await;
            report_submission(result.map(|m| m.id))
        }
        Command::Dynamic { track, options } => {
            let reconciler = reconciler(&cfg, &store)?;
            let request = DynamicMixRequest {
                source_track: track,
                separator: options.separator.clone(),
                separator_args: options.separator_args(),
                bitrate: options.bitrate,
            };
            let result = requests::submit_dynamic_mix(&cfg, &store, &reconciler, request, options.overwrite).await;
            report_submission(result.map(|m| m.id))
        }
        Command::List { json } => list_jobs(&store, json),
        Command::Delete { target, id } => {
            let reconciler = reconciler(&cfg, &store)?;
            let deleted = match target {
                DeleteTarget::SourceFile => reconciler.delete_source_file(id).await?,
                DeleteTarget::SourceTrack => reconciler.delete_source_track(id).await?,
                DeleteTarget::Static => reconciler.delete_static_mix(id).await?,
                DeleteTarget::Dynamic => reconciler.delete_dynamic_mix(id).await?,
                DeleteTarget::YtTask => reconciler.delete_yt_task(id).await?,
            };
            if !deleted {
                anyhow::bail!("{:?} {} not found", target, id);
            }
            Ok(())
        }
        Command::Recover => {
            let report = Recovery::new(&cfg, Arc::clone(&store)).run_once(Utc::now()).await?;
            println!(
                "{} job(s) requeued, {} workspace(s) removed",
                report.requeued.len(),
                report.removed_dirs.len()
            );
            Ok(())
        }
        Command::Audit => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
                .build()
                .context("Failed to build HTTP client")?;
            let broken = audit::audit_remote_urls(&store, &client).await;
            for b in &broken {
                println!("{}\t{}\t{}", b.owner, b.url, b.problem);
            }
            if !broken.is_empty() {
                anyhow::bail!("{} broken URL(s)", broken.len());
            }
            Ok(())
        }
    }
}

fn reconciler(cfg: &ServiceConfig, store: &Arc<JobStore>) -> Result<Reconciler> {
    let storage = HttpStorage::new(&cfg.storage)?;
    Ok(Reconciler::new(cfg, Arc::clone(store), Arc::new(storage)))
}

fn report_submission(result: Result<Uuid, SubmitError>) -> Result<()> {
    match result {
        Ok(id) => {
            println!("queued {}", id);
            Ok(())
        }
        Err(SubmitError::Duplicate(existing)) => {
            anyhow::bail!("an identical job already exists: {} (use --overwrite to replace it)", existing)
        }
        Err(SubmitError::Running(existing)) => {
            anyhow::bail!("an identical job is still running: {} (try again once it finishes)", existing)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_daemon(cfg: ServiceConfig, store: Arc<JobStore>) -> Result<()> {
    info!("Stem separation daemon starting");
    info!("Configuration loaded:");
    info!("  Media root: {}", cfg.media_root.display());
    info!("  Record store: {}", cfg.store_dir.display());
    info!("  Separator: {}", cfg.separator.program.display());
    info!("  Storage endpoint: {}", cfg.storage.endpoint);
    info!("  Job time limit: {}s, stale after {}s", cfg.job_time_limit_secs, cfg.stale_job_secs);
    if cfg.storage.token.is_none() {
        warn!("No storage token configured; uploads are unauthenticated");
    }

    std::fs::create_dir_all(cfg.separate_root())
        .with_context(|| format!("Failed to create workspace root: {}", cfg.separate_root().display()))?;

    let storage = Arc::new(HttpStorage::new(&cfg.storage)?);
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(cfg.fetch_timeout_secs))?);
    let separator = Arc::new(CommandSeparator::new(cfg.separator.clone()));
    let recovery = Recovery::new(&cfg, Arc::clone(&store));
    let ctx = Arc::new(PipelineContext::new(cfg, Arc::clone(&store), separator, storage, fetcher));

    info!("🔄 Starting recovery checks...");
    let report = recovery
        .run_once(Utc::now())
        .await
        .context("Failed to run startup recovery")?;
    if report.requeued.is_empty() && report.removed_dirs.is_empty() {
        info!("✅ Startup recovery complete: no stale jobs or orphaned workspaces found");
    } else {
        info!(
            "✅ Startup recovery complete: {} job(s) requeued, {} workspace(s) removed",
            report.requeued.len(),
            report.removed_dirs.len()
        );
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    Dispatcher::new(ctx).run(&recovery, shutdown).await
}

fn list_jobs(store: &JobStore, json: bool) -> Result<()> {
    let mut statics = store.all::<StaticMix>();
    let mut dynamics = store.all::<DynamicMix>();
    let mut tasks = store.all::<YtDownloadTask>();
    statics.sort_by_key(|m| m.state.date_created);
    dynamics.sort_by_key(|m| m.state.date_created);
    tasks.sort_by_key(|t| t.state.date_created);

    if json {
        for mix in &statics {
            println!("{}", serde_json::to_string(mix)?);
        }
        for mix in &dynamics {
            println!("{}", serde_json::to_string(mix)?);
        }
        for task in &tasks {
            println!("{}", serde_json::to_string(task)?);
        }
        return Ok(());
    }

    for mix in &statics {
        let parts: Vec<&str> = mix.parts.selected().into_iter().map(StemPart::as_str).collect();
        println!(
            "static   {}  {:>2} {:<11}  {}  {}kbps {}  {}",
            mix.id,
            mix.state.status.code(),
            mix.state.status.to_string(),
            parts.join("+"),
            mix.bitrate,
            mix.separator,
            mix.file_url.as_deref().unwrap_or(&mix.state.error)
        );
    }
    for mix in &dynamics {
        let uploaded = StemPart::DYNAMIC_ORDER.iter().filter(|p| mix.stem(**p).has_url()).count();
        println!(
            "dynamic  {}  {:>2} {:<11}  {}/5 stems  {}kbps {}  {}",
            mix.id,
            mix.state.status.code(),
            mix.state.status.to_string(),
            uploaded,
            mix.bitrate,
            mix.separator,
            mix.state.error
        );
    }
    for task in &tasks {
        println!(
            "youtube  {}  {:>2} {:<11}  {}",
            task.id,
            task.state.status.code(),
            task.state.status.to_string(),
            task.state.error
        );
    }
    Ok(())
}
