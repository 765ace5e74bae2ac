//! tunekeep-dl - fetch the identifiers listed in `links.txt`
//!
//! Each run fetches every identifier not yet recorded in the ledger,
//! rotating credential sets and client variants as the upstream refuses,
//! optionally uploads each artifact, and records it as done only after
//! delivery succeeded.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunekeep_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use tunekeep_common::input::read_identifier_list;
use tunekeep_common::{Ledger, LedgerOptions};
use tunekeep_dl::config::{self as run_config, SinkSettings};
use tunekeep_dl::orchestrator::pending_work;
use tunekeep_dl::sink::drive::ServiceAccountKey;
use tunekeep_dl::{
    Container, CredentialPool, DriveStore, FetchEngine, Orchestrator, RunOptions, SignalCatalogue,
    Sink, YtDlpFetcher,
};

const MODULE_NAME: &str = "tunekeep-dl";

/// Command-line arguments for tunekeep-dl
#[derive(Parser, Debug)]
#[command(name = "tunekeep-dl")]
#[command(about = "Fetch audio for listed links with credential rotation and a durable ledger")]
#[command(version)]
struct Args {
    /// Root folder holding links.txt, the ledger and the audio/ output
    #[arg(short, long, env = "TUNEKEEP_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Seconds to pause between identifiers
    #[arg(short, long)]
    sleep_seconds: Option<u64>,

    /// Process at most this many pending identifiers
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Skip uploading even when a folder is configured
    #[arg(long)]
    no_sink: bool,

    /// Only reconcile the ledger against links.txt, fetch nothing
    #[arg(long, conflicts_with = "dry_run")]
    reconcile_only: bool,

    /// List pending identifiers and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = TomlConfig::load_or_default(MODULE_NAME);

    // Initialize tracing
    let level = &toml_config.logging.level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tunekeep_dl={0},tunekeep_common={0}", level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tunekeep-dl {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve and lay out the root folder
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .resolve();
    let layout = RootFolderInitializer::new(root_folder)
        .with_ledger_file(toml_config.ledger_file.clone());
    layout
        .ensure_directory_exists()
        .with_context(|| format!("Failed to initialize root folder {}", layout.root().display()))?;
    info!("Root folder: {}", layout.root().display());

    // Step 2: Input list and ledger
    let all_ids = read_identifier_list(&layout.links_path())
        .with_context(|| format!("Failed to read {}", layout.links_path().display()))?;
    let ledger = Ledger::open_with(
        layout.ledger_path(),
        LedgerOptions {
            lock_wait: run_config::resolve_lock_wait(&toml_config),
        },
    )
    .with_context(|| format!("Failed to open ledger {}", layout.ledger_path().display()))?;

    let batch_size = run_config::resolve_batch_size(args.batch_size, &toml_config);

    if args.dry_run {
        let pending = pending_work(&all_ids, &ledger, batch_size);
        info!(total = all_ids.len(), done = ledger.len(), pending = pending.len(), "Dry run");
        for id in &pending {
            println!("{}", id);
        }
        return Ok(());
    }

    if args.reconcile_only {
        let mut ledger = ledger;
        let report = ledger
            .reconcile(&all_ids)
            .context("Failed to reconcile ledger")?;
        info!(kept = report.kept, dropped = report.dropped, "Reconcile complete");
        return Ok(());
    }

    // Step 3: Credentials, fetcher and sink
    let pool = CredentialPool::load_file(&layout.credentials_path()).unwrap_or_else(|e| {
        warn!("Cannot load credential sets, using anonymous access: {}", e);
        CredentialPool::empty()
    });

    let ytdlp_binary = run_config::resolve_ytdlp_binary(&toml_config);
    run_config::check_external_tools(&ytdlp_binary, toml_config.ffmpeg_location.as_deref());
    let fetcher = YtDlpFetcher::new(ytdlp_binary, layout.cache_dir())
        .with_ffmpeg_location(toml_config.ffmpeg_location.clone());

    let engine = FetchEngine::new(fetcher, pool, layout.output_dir())
        .with_catalogue(SignalCatalogue::from_config(&toml_config.signals))
        .with_po_token(run_config::resolve_po_token(&layout.po_token_path()));

    let sink = if args.no_sink {
        info!("Uploads disabled from the command line");
        None
    } else {
        match run_config::resolve_sink_settings(&toml_config) {
            Some(settings) => Some(build_sink(settings).await),
            None => None,
        }
    };

    let pace_secs = run_config::resolve_sleep_seconds(args.sleep_seconds, &toml_config);
    let options = RunOptions {
        pace: Duration::from_secs(pace_secs),
        batch_size,
    };

    // Step 4: Run
    let mut orchestrator = Orchestrator::new(engine, ledger, sink, options);
    let summary = orchestrator.run(&all_ids).await;
    summary.log();

    Ok(())
}

/// Build the Drive sink; any startup failure leaves it configured but unavailable
async fn build_sink(settings: SinkSettings) -> Sink {
    let container = Container::new(settings.folder_id.clone(), settings.shared);

    let store = ServiceAccountKey::from_sources(
        settings.service_account_json.as_deref(),
        settings.service_account_file.as_deref(),
    )
    .and_then(DriveStore::new);

    let sink = match store {
        Ok(store) => match store.verify_container(&container).await {
            Ok(name) => {
                info!(folder = %name, account = %store.client_email(), "Uploading to Drive");
                Sink::new(Box::new(store), container)
            }
            Err(e) => {
                warn!("Upload folder not reachable, nothing will be marked done this run: {}", e);
                Sink::unavailable(container, e.to_string())
            }
        },
        Err(e) => {
            warn!("Drive credentials unusable, nothing will be marked done this run: {}", e);
            Sink::unavailable(container, e.to_string())
        }
    };

    sink.with_sync_ledger(settings.sync_ledger)
}
