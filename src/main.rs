//! rarity-gate: local navigation policy daemon
//!
//! Runs next to the browser client and provides:
//! - Synchronous allow/block decisions for every top-level navigation
//! - Background rarity scoring with per-tab warnings
//! - Tier and referral state, reconciled periodically with the authority
//!
//! See DESIGN.md for details.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use rarity_gate::api::{create_router, spawn_warning_pump, ApiState, WarningBoard};
use rarity_gate::config::Config;
use rarity_gate::engine::{EngineSettings, InterceptionEngine};
use rarity_gate::policy::{PolicyEvaluator, TierThresholdTable};
use rarity_gate::reconciler::Reconciler;
use rarity_gate::remote::{HttpAuthority, RemoteAuthority};
use rarity_gate::router::MessageRouter;
use rarity_gate::store::{SqliteBackend, StateStore};

#[derive(Parser)]
#[command(name = "rarity-gate")]
#[command(about = "Navigation policy daemon with rarity scoring and tier reconciliation")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rarity-gate.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "RARITY_GATE_DATA_DIR")]
    data_dir: Option<String>,

    /// Scoring authority base URL (overrides config file)
    #[arg(long, env = "RARITY_GATE_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Installation key (overrides config file)
    #[arg(long, env = "RARITY_GATE_INSTALLATION_ID")]
    installation_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rarity_gate=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting rarity-gate");
    info!("Config file: {}", cli.config);

    // Load or create default config
    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading {}", cli.config))?;
        Config::from_toml(&content).with_context(|| format!("parsing {}", cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(gateway_url) = cli.gateway_url {
        config.remote.gateway_url = gateway_url;
    }
    if let Some(installation_id) = cli.installation_id {
        config.node.installation_id = installation_id;
    }

    info!("Installation: {}", config.node.installation_id);
    info!("Data dir: {}", config.node.data_dir.display());
    info!("Gateway: {}", config.remote.gateway_url);

    // State store
    let backend = SqliteBackend::open(&config.state_db_path())?;
    let store = Arc::new(StateStore::open(
        config.node.installation_id.clone(),
        Box::new(backend),
        config.policy.enabled_by_default,
    )?);

    // Remote authority
    let timeout = Duration::from_secs(config.remote.timeout_secs);
    let remote: Arc<dyn RemoteAuthority> =
        Arc::new(HttpAuthority::new(config.remote.gateway_url.clone(), timeout)?);

    // Interception engine and warning delivery
    let evaluator = PolicyEvaluator::new(TierThresholdTable::standard(), config.policy.grace_buffer);
    let (warning_tx, warning_rx) = mpsc::channel(256);
    let engine = Arc::new(InterceptionEngine::new(
        store.clone(),
        evaluator,
        remote.clone(),
        EngineSettings::from_config(&config),
        warning_tx,
    ));
    let warnings = Arc::new(WarningBoard::new());
    spawn_warning_pump(warnings.clone(), warning_rx);

    // Tier reconciler
    let reconciler = Arc::new(Reconciler::new(store.clone(), remote.clone(), timeout));
    let (reconcile_stop_tx, reconcile_stop_rx) = mpsc::channel(1);
    if config.reconcile.interval_secs > 0 {
        tokio::spawn(reconciler.clone().run(
            Duration::from_secs(config.reconcile.interval_secs),
            config.reconcile.on_startup,
            reconcile_stop_rx,
        ));
    } else {
        info!("Periodic reconciliation is disabled");
    }

    let router = Arc::new(MessageRouter::new(
        store.clone(),
        engine.clone(),
        reconciler,
        remote,
        config.policy.alternative_threshold,
        timeout,
    ));

    let app = create_router(Arc::new(ApiState { engine, router, warnings }));

    // Bind to HTTP port
    let addr = SocketAddr::from(([127, 0, 0, 1], config.api.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = reconcile_stop_tx.send(()).await;
    info!("rarity-gate stopped");

    Ok(())
}
