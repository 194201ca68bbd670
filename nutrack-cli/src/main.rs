use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nutrack_sync::{
    authorize_url, Broadcaster, ChannelBroadcaster, ConflictSide, DropboxOAuth, DropboxRemote,
    PkceChallenge, Scheduler, SqliteStore, StdioBroadcaster, SyncConfig, SyncEngine,
    SyncEngineBuilder, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod daemon;

#[derive(Parser)]
#[command(name = "nutrack-sync")]
#[command(about = "Sync the Nutrack database with Dropbox", long_about = None)]
struct Cli {
    /// Directory holding settings and credentials
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Database file (defaults to <data-dir>/nutrack.db)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an authorization URL and the PKCE verifier to pass to `login`
    LoginUrl,
    /// Exchange an authorization code for tokens
    Login {
        /// Code shown by Dropbox after granting access
        #[arg(long)]
        code: String,
        /// Verifier printed by `login-url`
        #[arg(long)]
        verifier: String,
    },
    /// Disable auto-sync and delete stored tokens
    Logout,
    /// Show authentication and sync state
    Status,
    /// Upload the local database
    Upload,
    /// Download the remote database
    Download,
    /// Run a reconciliation pass
    Sync {
        /// Ignore the check interval
        #[arg(short, long)]
        force: bool,
    },
    /// Resolve a sync conflict by keeping one side
    Resolve {
        #[arg(long, value_enum)]
        keep: Side,
    },
    /// Turn automatic sync on or off
    AutoSync {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Run the background scheduler until interrupted
    Run {
        /// Emit events as JSON lines on stdout
        #[arg(long)]
        stdio: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Side {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn init_tracing() {
    // Default to info level, override with RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout is reserved for command output and stdio events
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(cli: &Cli, broadcaster: Arc<dyn Broadcaster>) -> Result<SyncEngine> {
    let config = SyncConfig::new(&cli.data_dir).with_secrets_from_env();
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("nutrack.db"));

    let oauth = DropboxOAuth::new(config.client_id.clone(), config.client_secret.clone());

    SyncEngineBuilder::new(config)
        .with_store(Arc::new(SqliteStore::new(db_path)))
        .with_remote(Arc::new(DropboxRemote::new()))
        .with_token_endpoint(Arc::new(oauth))
        .with_broadcaster(broadcaster)
        .build()
        .context("Failed to initialize sync engine")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let stdio = matches!(cli.command, Commands::Run { stdio: true })
        || Transport::from_env() == Transport::Stdio;
    let channel = Arc::new(ChannelBroadcaster::default());
    let broadcaster: Arc<dyn Broadcaster> = if stdio {
        Arc::new(StdioBroadcaster::stdout())
    } else {
        channel.clone()
    };

    let engine = build_engine(&cli, broadcaster)?;

    match cli.command {
        Commands::LoginUrl => {
            let client_id = &engine.config().client_id;
            if client_id.is_empty() {
                bail!("DROPBOX_CLIENT_ID is not set");
            }
            let pkce = PkceChallenge::generate();
            let url = authorize_url(client_id, &pkce)?;
            print_json(&serde_json::json!({ "url": url, "verifier": pkce.verifier }))?;
        }

        Commands::Login { code, verifier } => {
            engine
                .exchange_code(&code, &verifier)
                .await
                .context("Failed to exchange authorization code")?;
            println!("Logged in");
        }

        Commands::Logout => {
            engine.logout()?;
            println!("Logged out");
        }

        Commands::Status => {
            let state = engine.state();
            print_json(&serde_json::json!({
                "authenticated": engine.is_authenticated().await,
                "autoSync": state.auto_sync_enabled,
                "synced": state.synced,
                "storedHash": state.stored_hash,
                "lastHashCheck": state.last_hash_check_millis,
            }))?;
        }

        Commands::Upload => {
            let outcome = engine.upload_database().await.context("Upload failed")?;
            print_json(&outcome)?;
        }

        Commands::Download => {
            let outcome = engine.download_database().await.context("Download failed")?;
            print_json(&outcome)?;
        }

        Commands::Sync { force } => {
            let check = engine.sync_if_due(force).await.context("Sync failed")?;
            println!("{:?}", check);
        }

        Commands::Resolve { keep } => {
            let side = match keep {
                Side::Local => ConflictSide::KeepLocal,
                Side::Remote => ConflictSide::KeepRemote,
            };
            let outcome = engine.resolve_conflict(side).await.context("Resolve failed")?;
            print_json(&outcome)?;
        }

        Commands::AutoSync { state } => {
            engine.set_auto_sync(matches!(state, Toggle::On))?;
            println!("Auto-sync {}", if engine.auto_sync() { "on" } else { "off" });
        }

        Commands::Run { .. } => {
            let scheduler = Scheduler::new(Arc::new(engine));
            daemon::run(scheduler, channel, stdio).await?;
        }
    }

    Ok(())
}
