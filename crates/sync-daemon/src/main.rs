//! sync-daemon: runs note sync passes against a vault on disk.
//!
//! Uses the same sync-core as the editor add-on, with a native filesystem and
//! a JSON state file inside the vault.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sync_core::auto_sync::{interval_from_settings, spawn_auto_sync};
use sync_core::settings::{ConflictPolicy, ServiceKind};
use sync_core::state::StateStore;
use sync_core::{ItemOutcome, SyncEvent, SyncManager, SyncStatus, SyncSummary};
use sync_daemon::{Config, JsonFileStore, NativeFs, Overrides};

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Sync a Markdown vault with a remote note service")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long, env = "NOTE_SYNC_VAULT")]
    vault: String,

    /// Remote service to use (notes or memos)
    #[arg(long, env = "NOTE_SYNC_SERVICE")]
    service: Option<ServiceKind>,

    /// Base URL of the remote service
    #[arg(long, env = "NOTE_SYNC_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the remote service
    #[arg(long, env = "NOTE_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// API key sent with signed requests
    #[arg(long, env = "NOTE_SYNC_API_KEY")]
    api_key: Option<String>,

    /// Secret used to sign requests
    #[arg(long, env = "NOTE_SYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Vault folder holding synced notes
    #[arg(long, env = "NOTE_SYNC_FOLDER")]
    folder: Option<String>,

    /// prefer-remote, prefer-local or manual
    #[arg(long, env = "NOTE_SYNC_CONFLICT_POLICY")]
    conflict_policy: Option<ConflictPolicy>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull remote notes into the vault
    Pull {
        /// Ignore the stored cursor and fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Push vault notes to the remote service
    Push,
    /// Pull periodically until interrupted
    Watch {
        /// Minutes between pulls (defaults to the saved interval)
        #[arg(long, env = "NOTE_SYNC_INTERVAL")]
        interval: Option<u64>,
    },
    /// Check that the remote service accepts our credentials
    TestConnection,
    /// Show the saved sync state
    Status,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            service: self.service,
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            api_key: self.api_key.clone(),
            secret: self.secret.clone(),
            folder: self.folder.clone(),
            conflict_policy: self.conflict_policy,
            interval_minutes: match self.command {
                Command::Watch { interval } => interval,
                _ => None,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_core=debug,sync_daemon=debug"
    } else {
        "info,sync_core=info,sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_path(&args.vault)?;
    info!(vault = %config.vault_name, path = %config.vault_path.display(), "Opening vault");

    let store = Arc::new(JsonFileStore::for_vault(&config.vault_path));
    let overrides = args.overrides();
    if !overrides.is_empty() {
        let mut state = store.load()?;
        overrides.apply(&mut state.settings);
        store.save(&state)?;
        debug!(path = %store.path().display(), "Saved settings overrides");
    }

    let fs = NativeFs::new(config.vault_path.clone());
    let manager = Arc::new(SyncManager::new(fs, store.clone())?);
    let _progress = manager.subscribe(log_event);

    match args.command {
        Command::Status => print_state(&store)?,
        Command::Pull { full } => {
            let summary = run_pass(&manager, manager.sync_from_server(full)).await?;
            report(&summary, &manager.sync_status());
        }
        Command::Push => {
            let summary = run_pass(&manager, manager.sync_to_server()).await?;
            report(&summary, &manager.sync_status());
        }
        Command::Watch { .. } => watch(manager, &store).await?,
        Command::TestConnection => {
            manager
                .test_connection()
                .await
                .with_context(|| format!("{} service unreachable", manager.kind()))?;
            println!("Connection to {} service OK", manager.kind());
        }
    }

    Ok(())
}

/// Run one pass, cancelling it on Ctrl+C.
async fn run_pass<T>(
    manager: &SyncManager<NativeFs>,
    pass: impl Future<Output = sync_core::Result<T>>,
) -> Result<T> {
    let cancel = manager.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling after the current note");
            cancel.cancel();
        }
    });

    let result = pass.await;
    interrupt.abort();
    Ok(result?)
}

async fn watch(manager: Arc<SyncManager<NativeFs>>, store: &JsonFileStore) -> Result<()> {
    let settings = store.load()?.settings;
    let Some(every) = interval_from_settings(&settings) else {
        bail!("auto-sync interval not set; pass --interval <minutes>");
    };

    let handle = spawn_auto_sync(manager.clone(), every);
    info!("Watching. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !handle.is_running() {
                    warn!("Auto-sync task exited");
                    break;
                }
            }
        }
    }

    manager.cancel_sync();
    handle.stop();
    info!("Shutting down");
    Ok(())
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::PhaseChanged { phase } => debug!(?phase, "Phase changed"),
        SyncEvent::ItemProcessed { label, outcome } => match outcome {
            ItemOutcome::Skipped => debug!(%label, "Skipped"),
            ItemOutcome::Failed | ItemOutcome::Conflict => warn!(%label, ?outcome, "Item not synced"),
            _ => info!(%label, ?outcome, "Synced"),
        },
        SyncEvent::ErrorRecorded { entry } => {
            warn!(label = %entry.label, message = %entry.message, "Sync error")
        }
        SyncEvent::Finished { summary } => debug!(%summary, "Pass finished"),
    }
}

fn report(summary: &SyncSummary, status: &SyncStatus) {
    println!("{summary}");
    for entry in &status.errors {
        println!("  {}: {}", entry.label, entry.message);
    }
}

fn print_state(store: &JsonFileStore) -> Result<()> {
    let state = store.load()?;
    let settings = &state.settings;
    let active = settings.active();
    let cursor = state.cursor(settings.service);

    println!("State file:  {}", store.path().display());
    println!("Service:     {} ({})", settings.service, active.base_url);
    println!("Folder:      {}", active.sync_folder);
    println!("Token set:   {}", !active.token.trim().is_empty());
    println!("Conflicts:   {:?}", settings.conflict_policy);
    match interval_from_settings(settings) {
        Some(every) => println!("Auto-sync:   every {} min", every.as_secs() / 60),
        None => println!("Auto-sync:   off"),
    }
    match (&cursor.last_sync_id, cursor.last_sync_time) {
        (None, None) => println!("Cursor:      none (next pull is a first sync)"),
        (id, time) => println!(
            "Cursor:      id={} time={}",
            id.as_deref().unwrap_or("-"),
            time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
        ),
    }
    println!("Cached ids:  {}", state.id_cache.len());
    Ok(())
}
