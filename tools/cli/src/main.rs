//! Storekeep CLI - Command line interface for the sync engine.
//!
//! Drives the same operations a UI would: status, manual sync and resync,
//! settings edits, backup and restore, and a long-running daemon mode.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use storekeep_common::{Error, Operation, PendingMutation, SettingsSection, UserId};
use storekeep_storage::gdrive::{AuthManager, DriveClient, OAuthSessionProvider, Tokens, DRIVE_SCOPE};
use storekeep_storage::{
    FileStateStore, FileTableStore, RestMetadataClient, SnapshotClient, TokenBroker,
};
use storekeep_sync::{JournalQueue, SyncContext, SyncEngine, SyncScheduler};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "storekeep")]
#[command(about = "Storekeep - Offline-first business data sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status.
    Status,

    /// Run one sync pass and wait for it.
    Sync,

    /// Reset sync bookkeeping and sync from scratch.
    Resync,

    /// Upload settings and tables to the user's cloud folder.
    Backup {
        /// Account identifier.
        #[arg(short, long)]
        user: String,
    },

    /// Download settings and tables from the user's cloud folder.
    Restore {
        /// Account identifier.
        #[arg(short, long)]
        user: String,
    },

    /// Show or edit settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Mark onboarding complete or start it over.
    Onboarding {
        #[command(subcommand)]
        action: OnboardingAction,
    },

    /// Queue an entity write for upload.
    Enqueue {
        /// Table name, e.g. "products".
        entity: String,
        /// create, update or delete.
        operation: String,
        /// Entity JSON.
        payload: String,
    },

    /// Print the cloud authorization URL.
    LoginUrl,

    /// Exchange an authorization code for tokens.
    Login {
        #[arg(long)]
        code: String,
    },

    /// Sync periodically until interrupted.
    Daemon,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the settings document.
    Show,
    /// Merge a JSON object into one section.
    Set {
        /// store, tax, invoice or user.
        section: String,
        /// JSON object with the fields to change.
        patch: String,
    },
}

#[derive(Subcommand)]
enum OnboardingAction {
    Complete,
    Reset,
}

/// Wired-up engine plus what the commands need beside it.
struct App {
    engine: SyncEngine,
    queue: Arc<JournalQueue>,
    session: Arc<OAuthSessionProvider>,
    tokens_path: PathBuf,
}

impl App {
    async fn build(config: &AppConfig) -> Result<Self> {
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let store = Arc::new(
            FileStateStore::open(data_dir.join("state.json"))
                .await
                .context("Failed to open local state")?,
        );
        let tables = Arc::new(FileTableStore::new(data_dir.join("tables")));
        let ctx = Arc::new(SyncContext::load(config.sync.clone(), store.clone(), tables.clone()).await?);

        let metadata = Arc::new(RestMetadataClient::new(
            &config.metadata,
            store.clone(),
            config.sync.request_timeout(),
        )?);
        let queue = Arc::new(JournalQueue::new(store, tables, metadata.clone()));

        let tokens_path = data_dir.join("drive_tokens.json");
        let tokens = load_tokens(&tokens_path).await;
        let session = Arc::new(OAuthSessionProvider::new(
            AuthManager::new(config.auth.clone())?,
            tokens,
        ));
        let broker = Arc::new(
            TokenBroker::new(session.clone(), DRIVE_SCOPE)
                .with_timeout(config.sync.request_timeout()),
        );
        let drive = Arc::new(DriveClient::new(config.sync.request_timeout())?);
        let snapshots = Arc::new(SnapshotClient::new(drive, config.sync.app_name.clone()));

        let engine = SyncEngine::new(ctx, queue.clone(), metadata, snapshots, broker);
        Ok(Self {
            engine,
            queue,
            session,
            tokens_path,
        })
    }

    /// Let background pushes finish and keep refreshed tokens.
    async fn finish(&self) -> Result<()> {
        self.engine.flush_background().await;
        if let Some(tokens) = self.session.tokens().await {
            save_tokens(&self.tokens_path, &tokens).await?;
        }
        Ok(())
    }
}

async fn load_tokens(path: &Path) -> Option<Tokens> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            warn!("Ignoring unreadable token file {}: {}", path.display(), e);
            None
        }
    }
}

async fn save_tokens(path: &Path, tokens: &Tokens) -> Result<()> {
    let json = serde_json::to_string_pretty(tokens)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AppConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::LoginUrl => return cmd_login_url(&config),
        Commands::Login { code } => return cmd_login(&config, code).await,
        _ => {}
    }

    let app = App::build(&config).await?;
    let result = match cli.command {
        Commands::Status => cmd_status(&app).await,
        Commands::Sync => cmd_sync(&app).await,
        Commands::Resync => cmd_resync(&app).await,
        Commands::Backup { user } => cmd_backup(&app, &user).await,
        Commands::Restore { user } => cmd_restore(&app, &user).await,
        Commands::Settings { action } => cmd_settings(&app, action).await,
        Commands::Onboarding { action } => cmd_onboarding(&app, action).await,
        Commands::Enqueue {
            entity,
            operation,
            payload,
        } => cmd_enqueue(&app, &entity, &operation, &payload).await,
        Commands::Daemon => cmd_daemon(&app, &config).await,
        Commands::LoginUrl | Commands::Login { .. } => Ok(()),
    };

    app.finish().await?;
    result
}

/// Show sync status.
async fn cmd_status(app: &App) -> Result<()> {
    let pending = app.engine.pending_length().await?;
    let settings = app.engine.context().load_settings().await?;
    let state = app.engine.state();

    println!("Sync status:");
    println!("  Phase: {}", state.phase);
    match state.last_synced {
        Some(at) => println!("  Last synced: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last synced: never"),
    }
    println!("  Pending uploads: {}", pending);
    println!("  Settings dirty: {}", state.dirty);
    println!("  Onboarded: {}", settings.is_onboarded());

    Ok(())
}

async fn cmd_sync(app: &App) -> Result<()> {
    info!("Running sync pass");
    if app.engine.run_sync(true).await {
        println!("Sync complete.");
    } else {
        println!("Sync did not complete: {}", app.engine.state().status_message);
    }
    Ok(())
}

async fn cmd_resync(app: &App) -> Result<()> {
    match app.engine.force_resync().await {
        Ok(true) => println!("Resync complete."),
        Ok(false) => println!("Resync did not complete: {}", app.engine.state().status_message),
        Err(Error::GuardViolation { pending }) => {
            anyhow::bail!(
                "{} change(s) are still waiting to upload. Run `storekeep sync` first, then try again.",
                pending
            );
        }
        Err(e) => return Err(e).context("Resync failed"),
    }
    Ok(())
}

async fn cmd_backup(app: &App, user: &str) -> Result<()> {
    let user = UserId::new(user).context("Invalid user id")?;
    if app.engine.backup_now(&user).await {
        println!("Backup uploaded for {}.", user);
    } else {
        println!("Backup skipped or failed; see log for details.");
    }
    Ok(())
}

async fn cmd_restore(app: &App, user: &str) -> Result<()> {
    let user = UserId::new(user).context("Invalid user id")?;
    let report = app
        .engine
        .restore(&user)
        .await
        .context("Restore failed")?;

    println!("Restore complete:");
    println!("  Settings restored: {}", report.settings_restored);
    if report.tables_restored.is_empty() {
        println!("  No table snapshots found");
    } else {
        println!("  Tables: {}", report.tables_restored.join(", "));
        println!("  Rows written: {}", report.rows_written);
    }
    Ok(())
}

async fn cmd_settings(app: &App, action: SettingsAction) -> Result<()> {
    let doc = match action {
        SettingsAction::Show => app.engine.context().load_settings().await?,
        SettingsAction::Set { section, patch } => {
            let section: SettingsSection = section.parse()?;
            let patch: serde_json::Value =
                serde_json::from_str(&patch).context("Patch is not valid JSON")?;
            app.engine
                .update_settings_section(section, &patch)
                .await
                .context("Failed to save settings")?
        }
    };
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn cmd_onboarding(app: &App, action: OnboardingAction) -> Result<()> {
    match action {
        OnboardingAction::Complete => {
            let doc = app.engine.complete_onboarding().await?;
            if let Some(at) = doc.onboarded_at {
                println!("Onboarding completed at {}", at.to_rfc3339());
            }
        }
        OnboardingAction::Reset => {
            app.engine.reset_onboarding().await?;
            println!("Onboarding reset; other settings kept.");
        }
    }
    Ok(())
}

async fn cmd_enqueue(app: &App, entity: &str, operation: &str, payload: &str) -> Result<()> {
    let operation: Operation = operation.parse()?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    app.queue
        .enqueue(PendingMutation::new(entity, operation, payload))
        .await
        .context("Failed to queue change")?;
    println!("Queued. Pending uploads: {}", app.engine.pending_length().await?);
    Ok(())
}

fn cmd_login_url(config: &AppConfig) -> Result<()> {
    let auth = AuthManager::new(config.auth.clone())?;
    let (url, state) = auth.authorization_url();
    println!("Open this URL to authorize cloud backup:\n\n  {}\n", url);
    println!("State: {}", state);
    Ok(())
}

async fn cmd_login(config: &AppConfig, code: &str) -> Result<()> {
    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;

    let auth = AuthManager::new(config.auth.clone())?;
    let tokens = auth
        .exchange_code(code)
        .await
        .context("Failed to exchange authorization code")?;
    save_tokens(&data_dir.join("drive_tokens.json"), &tokens).await?;

    println!("Signed in. Token valid until {}", tokens.expires_at.to_rfc3339());
    Ok(())
}

async fn cmd_daemon(app: &App, config: &AppConfig) -> Result<()> {
    app.engine.start().await;

    let handle = SyncScheduler::spawn(app.engine.clone(), config.sync.sync_interval());
    println!(
        "Syncing every {}s. Press Ctrl-C to stop.",
        config.sync.sync_interval().as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping scheduler");
    handle.shutdown().await;
    Ok(())
}
