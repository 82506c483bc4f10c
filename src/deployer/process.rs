//! Supervision of spawned agent processes
//!
//! Each spawned agent gets one supervisor task that owns the child handle,
//! pipes stdio into the session log, and restarts the process on unexpected
//! exit with exponential backoff. Flapping clean exits inside the stability
//! window and exhausted retries both stop supervision and report the
//! instance instead of restarting forever.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain_types::AgentInstanceId;
use crate::session_log::{SessionLog, Severity};

/// Cap on the exponential restart backoff
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Reported by a supervisor when it gives up on its process
#[derive(Debug)]
pub(crate) enum ProcessEvent {
    /// Launch or restart attempts are exhausted
    Exhausted { instance_id: AgentInstanceId },
    /// More than one clean exit inside the stability window
    Unstable { instance_id: AgentInstanceId },
}

/// Launch parameters for one spawned agent
pub(crate) struct SpawnParams {
    pub instance_id: AgentInstanceId,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub max_retries: u32,
    pub restart_backoff_base: Duration,
    pub stability_window: Duration,
    pub shutdown_timeout: Duration,
}

/// A supervised process owned by the deployer
pub(crate) struct ProcessHandle {
    pub instance_id: AgentInstanceId,
    pub stop: CancellationToken,
    pub supervisor: JoinHandle<()>,
}

impl ProcessHandle {
    /// Signals supervision to end and waits for the child to go away
    ///
    /// The supervisor grants the child the shutdown timeout to exit on its
    /// own (a drain envelope is usually already on its way), then kills it.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.supervisor.await;
    }
}

/// Spawns a supervised agent process
pub(crate) fn spawn_supervised(
    params: SpawnParams,
    session_log: SessionLog,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> ProcessHandle {
    let stop = CancellationToken::new();
    let instance_id = params.instance_id.clone();
    let supervisor = tokio::spawn(supervise(params, session_log, events, stop.clone()));
    ProcessHandle {
        instance_id,
        stop,
        supervisor,
    }
}

async fn supervise(
    params: SpawnParams,
    session_log: SessionLog,
    events: mpsc::UnboundedSender<ProcessEvent>,
    stop: CancellationToken,
) {
    let source = params.instance_id.to_string();
    let mut restarts = 0u32;
    let mut window_start = tokio::time::Instant::now();
    let mut clean_exits_in_window = 0u32;

    loop {
        let mut child = match Command::new(&params.binary)
            .args(&params.args)
            .envs(params.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(instance_id = %source, error = %e, "failed to launch agent binary");
                session_log.error(&source, format!("launch failed: {e}"));
                let _ = events.send(ProcessEvent::Exhausted {
                    instance_id: params.instance_id.clone(),
                });
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let _ = session_log.pipe_child_stream(stdout, format!("{source}/stdout"), Severity::Info);
        }
        if let Some(stderr) = child.stderr.take() {
            let _ = session_log.pipe_child_stream(stderr, format!("{source}/stderr"), Severity::Warn);
        }
        info!(instance_id = %source, binary = %params.binary.display(), "agent process launched");

        let status = tokio::select! {
            _ = stop.cancelled() => {
                // Cell stop: the drain envelope is in flight; give the child
                // the shutdown window, then force-terminate laggards.
                match tokio::time::timeout(params.shutdown_timeout, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(instance_id = %source, "shutdown timeout, killing process");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
                return;
            }
            status = child.wait() => status,
        };

        let success = status.map(|s| s.success()).unwrap_or(false);
        session_log.warn(
            &source,
            format!("process exited unexpectedly (success={success})"),
        );

        if success {
            if window_start.elapsed() < params.stability_window {
                clean_exits_in_window += 1;
                if clean_exits_in_window > 1 {
                    warn!(instance_id = %source, "process is flapping, giving up");
                    let _ = events.send(ProcessEvent::Unstable {
                        instance_id: params.instance_id.clone(),
                    });
                    return;
                }
            } else {
                window_start = tokio::time::Instant::now();
                clean_exits_in_window = 1;
            }
        } else {
            restarts += 1;
            if restarts > params.max_retries {
                warn!(instance_id = %source, restarts, "restart attempts exhausted");
                let _ = events.send(ProcessEvent::Exhausted {
                    instance_id: params.instance_id.clone(),
                });
                return;
            }
            let backoff = params
                .restart_backoff_base
                .saturating_mul(2u32.saturating_pow(restarts - 1))
                .min(RESTART_BACKOFF_CAP);
            info!(instance_id = %source, restarts, backoff_ms = backoff.as_millis() as u64, "restarting agent process");
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
