//! The Plan-Execute-Verify coordinator as a spawnable agent
//!
//! Bootstraps from the injected environment, subscribes to the workflow
//! topics, and coordinates planner, executor, and verifier peers until the
//! deployer drains it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{info, warn};

use agen::client::AgentRuntime;
use agen::coordinator::{PevBehavior, PevConfig, PevCoordinator};
use agen::domain_types::MaxIterations;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agen=info")),
        )
        .init();

    let runtime = AgentRuntime::from_env().await?;
    let config = pev_config(&runtime.ctx().config);
    info!(
        agent_id = %runtime.ctx().agent_id,
        max_iterations = %config.max_iterations,
        "coordinator starting"
    );

    let coordinator = PevCoordinator::new(Arc::new(runtime.client().clone()), config);
    let ingress = coordinator.ingress_topics();
    let behavior = Arc::new(PevBehavior::new(coordinator));

    // a local interrupt drains the same way a deployer shutdown does
    {
        let client = runtime.client().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, draining");
                let _ = client.drain().await;
            }
        });
    }

    runtime.serve(ingress, behavior).await?;
    info!("coordinator stopped");
    Ok(())
}

/// Coordinator policy from the resolved instance configuration
fn pev_config(config: &Map<String, Value>) -> PevConfig {
    let mut pev = PevConfig::default();
    if let Some(max) = config.get("max_iterations").and_then(Value::as_u64) {
        match MaxIterations::try_new(max as u32) {
            Ok(max) => pev.max_iterations = max,
            Err(_) => warn!(max, "max_iterations out of bounds, keeping default"),
        }
    }
    for (key, slot) in [
        ("planning_deadline_ms", &mut pev.planning_deadline),
        ("executing_deadline_ms", &mut pev.executing_deadline),
        ("verifying_deadline_ms", &mut pev.verifying_deadline),
        ("request_gc_grace_ms", &mut pev.request_gc_grace),
    ] {
        if let Some(ms) = config.get(key).and_then(Value::as_u64) {
            *slot = Duration::from_millis(ms);
        }
    }
    pev
}
