//! The orchestrator process
//!
//! Starts the support service, the broker, and the deployer in that order,
//! runs the declared cells, and shuts everything down on interrupt. Exit
//! codes: 0 clean shutdown, 1 configuration error, 2 broker or support
//! failed to bind, 3 all cells failed to start, 130 interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agen::broker::MessageBroker;
use agen::client::{AgenClient, ClientConfig};
use agen::config::{OrchestratorConfig, env_overrides};
use agen::deployer::AgentDeployer;
use agen::domain_types::AgentInstanceId;
use agen::error::OrchestratorError;
use agen::session_log::SessionLog;
use agen::support::{SupportRegistry, SupportService};

#[derive(Parser, Debug)]
#[command(name = "agen", about = "Agent orchestration core", version)]
struct Cli {
    /// Path to the orchestrator configuration file
    #[arg(short, long, default_value = "agen.yaml")]
    config: PathBuf,

    /// Overrides the configured data root
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Overrides the configured session log path
    #[arg(long)]
    session_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agen=info")),
        )
        .init();

    let code = match run(Cli::parse()).await {
        Ok(()) => 0,
        Err(e @ OrchestratorError::Interrupted) => e.exit_code(),
        Err(e) => {
            error!(error = %e, "orchestrator exiting");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), OrchestratorError> {
    let mut config = OrchestratorConfig::load(&cli.config)?;
    if let Some(data_root) = cli.data_root {
        config.data_root = data_root;
    }
    if let Some(session_log) = cli.session_log {
        config.session_log = Some(session_log);
    }
    let config = Arc::new(config);
    info!(project_id = %config.project_id, cells = config.cells.len(), "configuration loaded");

    let session_log_path = config
        .session_log
        .clone()
        .unwrap_or_else(|| config.data_root.join("agen-session.log"));
    if let Some(parent) = session_log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| {
            OrchestratorError::Config(agen::config::ConfigError::Read {
                path: session_log_path.clone(),
                source,
            })
        })?;
    }
    let (session_log, _log_writer) =
        SessionLog::open(&session_log_path)
            .await
            .map_err(|source| {
                OrchestratorError::Config(agen::config::ConfigError::Read {
                    path: session_log_path.clone(),
                    source,
                })
            })?;
    session_log.info("orchestrator", "session started");

    let cancel = CancellationToken::new();

    // support first: everything else registers through it
    let (registry, stale_rx) = SupportRegistry::new(config.support.registry_config(env_overrides()));
    let support = SupportService::start(&config.support.bind, registry.clone(), cancel.child_token())
        .await
        .map_err(|source| OrchestratorError::Bind {
            component: "support",
            source,
        })?;
    let support_endpoint = support.local_addr().to_string();
    info!(endpoint = %support_endpoint, "support service up");
    let _health_scan = registry.start_health_scanner(cancel.child_token());

    for decl in &config.pool {
        if let Err(e) = registry.register_type(decl.type_spec()).await {
            warn!(type_id = %decl.type_id, error = %e, "agent type not registered");
        }
    }

    // broker second: it advertises itself through the registry
    let broker_config = config
        .broker
        .broker_config(registry.heartbeat_interval())?;
    let broker = MessageBroker::start(
        broker_config,
        Some(registry.clone()),
        Some(stale_rx),
        cancel.child_token(),
    )
    .await
    .map_err(|source| OrchestratorError::Bind {
        component: "broker",
        source,
    })?;
    let broker_endpoint = broker.local_addr().to_string();

    // control client carries cell events and drain messages
    let control_id = AgentInstanceId::try_new("agen-deployer".to_string())
        .unwrap_or_else(|_| unreachable!("constant id is valid"));
    let control = match AgenClient::connect(ClientConfig::new(
        broker_endpoint.clone(),
        control_id,
        config.project_id.clone(),
    ))
    .await
    {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "control client unavailable, cell events disabled");
            None
        }
    };

    let deployer = AgentDeployer::new(
        registry.clone(),
        config.clone(),
        support_endpoint,
        session_log.clone(),
        control,
        cancel.child_token(),
    );

    let started = deployer.start_all().await;
    if !config.cells.is_empty() && started == 0 {
        session_log.error("orchestrator", "no cell started, shutting down");
        deployer.stop_all().await;
        broker.shutdown().await;
        support.abort();
        return Err(OrchestratorError::NoCellStarted);
    }
    info!(started, "orchestrator running");

    // periodic broker stats into the session log
    {
        let session_log = session_log.clone();
        let stats = broker.shared_stats();
        let stats_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stats_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        session_log.info(
                            "broker",
                            format!(
                                "connections={} subscriptions={} delivered={} rejected={}",
                                snapshot.connections_active,
                                snapshot.subscriptions_active,
                                snapshot.envelopes_delivered,
                                snapshot.publishes_rejected
                            ),
                        );
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|source| OrchestratorError::Bind {
            component: "signal handler",
            source,
        })?;
    info!("interrupt received, shutting down");
    session_log.warn("orchestrator", "interrupt received");

    // cells drain first, while the broker still routes their messages
    deployer.stop_all().await;
    cancel.cancel();
    broker.shutdown().await;
    support.abort();
    session_log.info("orchestrator", "session ended");
    tokio::time::sleep(Duration::from_millis(50)).await;

    Err(OrchestratorError::Interrupted)
}
