use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use canvasd::audit::AuditLog;
use canvasd::config::{CanvasConfig, CliOverrides};
use canvasd::http::{ActionHandler, CanvasHost};
use canvasd::manager::CanvasManager;
use canvasd::metrics::CanvasMetrics;
use canvasd::store::{memory::MemoryStore, sqlite::SqliteStore, SharedStore};
use canvasd::watch::AssetWatcher;

#[derive(Parser)]
#[command(
    name = "canvasd",
    about = "Canvas host — live per-session UI surface for the agent gateway",
    version
)]
struct Args {
    /// Canvas static root directory (required here or in config.toml)
    #[arg(long, env = "CANVASD_ROOT")]
    root: Option<std::path::PathBuf>,

    /// HTTP bind host
    #[arg(long, env = "CANVASD_HOST")]
    host: Option<String>,

    /// HTTP bind port
    #[arg(long, env = "CANVASD_PORT")]
    port: Option<u16>,

    /// Route namespace prefix (default: /__nexus__)
    #[arg(long, env = "CANVASD_NAMESPACE")]
    namespace: Option<String>,

    /// Auxiliary UI root directory
    #[arg(long, env = "CANVASD_A2UI_ROOT")]
    a2ui_root: Option<std::path::PathBuf>,

    /// Data directory for the SQLite database, audit log, and config.toml
    #[arg(long, env = "CANVASD_DATA_DIR", default_value = ".canvasd")]
    data_dir: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CANVASD_LOG")]
    log: Option<String>,

    /// Enable the live-reload watcher and WebSocket endpoints
    #[arg(long, env = "CANVASD_LIVE_RELOAD")]
    live_reload: bool,

    /// Token signing secret (empty disables token verification)
    #[arg(long, env = "CANVASD_TOKEN_SECRET")]
    token_secret: Option<String>,

    /// Minted-token lifetime in seconds (0 = no expiry)
    #[arg(long, env = "CANVASD_TOKEN_TTL_SECS")]
    token_ttl_secs: Option<u64>,

    /// Use the in-memory store instead of SQLite
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = CanvasConfig::load(
        args.data_dir.clone(),
        CliOverrides {
            host: args.host,
            port: args.port,
            root: args.root,
            namespace: args.namespace,
            a2ui_root: args.a2ui_root,
            live_reload: args.live_reload.then_some(true),
            log: args.log,
            token_secret: args.token_secret,
            token_ttl_secs: args.token_ttl_secs,
        },
    )
    .context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store: SharedStore = if args.memory_store {
        info!("using in-memory session store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            SqliteStore::new(&config.data_dir)
                .await
                .context("opening canvas database")?,
        )
    };

    let metrics = Arc::new(CanvasMetrics::new());
    let audit = Arc::new(AuditLog::new(&config.data_dir));
    let manager = Arc::new(
        CanvasManager::new(Some(store))
            .with_audit(audit)
            .with_metrics(Arc::clone(&metrics)),
    );

    // Standalone hosts have no agent runtime attached: log accepted actions
    // so UI wiring can be exercised end to end.
    let log_actions: ActionHandler = Arc::new(|ctx, action| {
        Box::pin(async move {
            info!(
                session_id = %action.session_id,
                name = %action.name,
                user = ctx.user_id.as_deref().unwrap_or("-"),
                "action received"
            );
            Ok(())
        })
    });

    let host = CanvasHost::new(config.clone(), manager)
        .context("building canvas host")?
        .with_metrics(Arc::clone(&metrics))
        .with_action_handler(log_actions);

    let _watcher = if config.live_reload {
        let mut roots = vec![config.root.clone()];
        if let Some(aux) = &config.a2ui_root {
            if aux != &config.root {
                roots.push(aux.clone());
            }
        }
        let watcher = AssetWatcher::start(&roots, host.live_hub(), Some(metrics))
            .context("starting asset watcher")?;
        info!(roots = roots.len(), "live-reload watcher started");
        Some(watcher)
    } else {
        None
    };

    host.serve().await
}
