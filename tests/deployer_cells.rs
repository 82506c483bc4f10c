//! Cell lifecycle: atomic start, rollback, await probes, and stop

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use tokio_util::sync::CancellationToken;

use agen::config::{
    AgentDecl, AgentTypeDecl, CellDecl, OrchestrationPolicy, OrchestratorConfig,
};
use agen::deployer::{AgentDeployer, CellStatus, DeployError};
use agen::domain_types::{AgentInstanceId, AgentTypeId, CellId, ProjectId, RestartLimit};
use agen::session_log::SessionLog;
use agen::support::{
    InstanceFilter, InstanceStatus, OperatorMode, RegistryConfig, ResourceHints, SupportRegistry,
};

fn instance(id: &str) -> AgentInstanceId {
    AgentInstanceId::try_new(id.to_string()).unwrap()
}

fn type_id(id: &str) -> AgentTypeId {
    AgentTypeId::try_new(id.to_string()).unwrap()
}

fn cell_id(id: &str) -> CellId {
    CellId::try_new(id.to_string()).unwrap()
}

fn spawn_type(id: &str, binary: &str, args: &[&str]) -> AgentTypeDecl {
    AgentTypeDecl {
        type_id: type_id(id),
        binary: Some(binary.into()),
        args: args.iter().map(|a| (*a).to_string()).collect(),
        operator: OperatorMode::Spawn,
        capabilities: Vec::new(),
        config: Map::new(),
        ingress: None,
        egress: None,
        resources: ResourceHints::default(),
    }
}

fn call_type(id: &str) -> AgentTypeDecl {
    AgentTypeDecl {
        type_id: type_id(id),
        binary: None,
        args: Vec::new(),
        operator: OperatorMode::Call,
        capabilities: Vec::new(),
        config: Map::new(),
        ingress: None,
        egress: None,
        resources: ResourceHints::default(),
    }
}

fn agent(id: &str, type_name: &str, deps: &[&str]) -> AgentDecl {
    AgentDecl {
        instance_id: instance(id),
        type_id: type_id(type_name),
        operator: None,
        ingress: None,
        egress: None,
        config: Map::new(),
        depends_on: deps.iter().map(|d| instance(d)).collect(),
        probe_endpoint: None,
    }
}

fn policy(startup_ms: u64) -> OrchestrationPolicy {
    OrchestrationPolicy {
        startup_timeout_ms: startup_ms,
        shutdown_timeout_ms: 100,
        max_retries: RestartLimit::try_new(1).unwrap(),
        health_check_interval_ms: 1_000,
        parallel_startup: true,
        await_timeout_ms: 300,
        stability_window_ms: 1_000,
        restart_backoff_base_ms: 10,
    }
}

async fn deployer_for(
    pool: Vec<AgentTypeDecl>,
    cells: Vec<CellDecl>,
) -> (AgentDeployer, SupportRegistry, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(OrchestratorConfig {
        project_id: ProjectId::try_new("test".to_string()).unwrap(),
        data_root: dir.path().to_path_buf(),
        session_log: None,
        support: Default::default(),
        broker: Default::default(),
        pool,
        cells,
    });
    let (registry, _stale_rx) = SupportRegistry::new(RegistryConfig::default());
    for decl in &config.pool {
        registry.register_type(decl.type_spec()).await.unwrap();
    }
    let (session_log, _writer) = SessionLog::open(&dir.path().join("session.log"))
        .await
        .unwrap();
    let deployer = AgentDeployer::new(
        registry.clone(),
        config,
        "127.0.0.1:0".to_string(),
        session_log,
        None,
        CancellationToken::new(),
    );
    (deployer, registry, dir)
}

#[test_log::test(tokio::test)]
async fn test_call_cell_starts_and_stops() {
    let cells = vec![CellDecl {
        cell_id: cell_id("services"),
        policy: policy(2_000),
        agents: vec![agent("svc-1", "svc", &[]), agent("svc-2", "svc", &["svc-1"])],
    }];
    let (deployer, registry, _dir) = deployer_for(vec![call_type("svc")], cells).await;

    deployer.start_cell(&cell_id("services")).await.unwrap();
    assert_eq!(
        deployer.cell_status(&cell_id("services")).await,
        Some(CellStatus::Started)
    );
    let record = registry.get_instance(&instance("svc-2")).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Ready);
    assert_eq!(record.cell_id, Some(cell_id("services")));

    deployer.stop_cell(&cell_id("services")).await.unwrap();
    assert_eq!(
        deployer.cell_status(&cell_id("services")).await,
        Some(CellStatus::Stopped)
    );
    assert!(registry.get_instance(&instance("svc-1")).await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_cell_rolls_back_when_an_agent_misses_startup() {
    // a reports ready (the test stands in for its process); b never
    // registers; c must never be spawned
    let cells = vec![CellDecl {
        cell_id: cell_id("pipeline"),
        policy: policy(800),
        agents: vec![
            agent("a-1", "worker", &[]),
            agent("b-1", "worker", &["a-1"]),
            agent("c-1", "worker", &["b-1"]),
        ],
    }];
    let (deployer, registry, _dir) =
        deployer_for(vec![spawn_type("worker", "sleep", &["30"])], cells).await;

    let registry_for_agent = registry.clone();
    let impersonator = tokio::spawn(async move {
        loop {
            let ok = registry_for_agent
                .register_instance(instance("a-1"), type_id("worker"), Map::new())
                .await
                .is_ok();
            if ok {
                registry_for_agent
                    .heartbeat(&instance("a-1"), InstanceStatus::Ready)
                    .await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let result = deployer.start_cell(&cell_id("pipeline")).await;
    impersonator.abort();

    assert!(matches!(
        result,
        Err(DeployError::StartupTimeout { ref instance_id }) if instance_id == &instance("b-1")
    ));
    assert_eq!(
        deployer.cell_status(&cell_id("pipeline")).await,
        Some(CellStatus::Failed)
    );

    // nothing from the cell survives in the registry's live set
    let leftovers = registry
        .list_instances(&InstanceFilter {
            cell_id: Some(cell_id("pipeline")),
            ..InstanceFilter::default()
        })
        .await;
    assert!(leftovers.is_empty(), "leftover records: {leftovers:?}");
    assert!(registry.get_instance(&instance("c-1")).await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_await_operator_passes_with_live_endpoint() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();

    let mut db = agent("db-1", "db", &[]);
    db.probe_endpoint = Some(endpoint);
    let cells = vec![CellDecl {
        cell_id: cell_id("stack"),
        policy: policy(2_000),
        agents: vec![db],
    }];
    let mut decl = call_type("db");
    decl.operator = OperatorMode::Await;
    let (deployer, registry, _dir) = deployer_for(vec![decl], cells).await;

    deployer.start_cell(&cell_id("stack")).await.unwrap();
    assert_eq!(
        deployer.cell_status(&cell_id("stack")).await,
        Some(CellStatus::Started)
    );
    let record = registry.get_instance(&instance("db-1")).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Ready);
}

#[test_log::test(tokio::test)]
async fn test_await_operator_fails_without_endpoint() {
    let mut db = agent("db-1", "db", &[]);
    // nothing listens on a reserved port
    db.probe_endpoint = Some("127.0.0.1:1".to_string());
    let cells = vec![CellDecl {
        cell_id: cell_id("stack"),
        policy: policy(2_000),
        agents: vec![db],
    }];
    let mut decl = call_type("db");
    decl.operator = OperatorMode::Await;
    let (deployer, _registry, _dir) = deployer_for(vec![decl], cells).await;

    let result = deployer.start_cell(&cell_id("stack")).await;
    assert!(matches!(result, Err(DeployError::AwaitTimeout { .. })));
    assert_eq!(
        deployer.cell_status(&cell_id("stack")).await,
        Some(CellStatus::Failed)
    );
}

#[test_log::test(tokio::test)]
async fn test_unregistered_type_fails_the_cell_only() {
    let cells = vec![CellDecl {
        cell_id: cell_id("broken"),
        policy: policy(1_000),
        agents: vec![agent("x-1", "ghost", &[])],
    }];
    // pool is empty: nothing registered the ghost type
    let (deployer, _registry, _dir) = deployer_for(Vec::new(), cells).await;

    let result = deployer.start_cell(&cell_id("broken")).await;
    assert!(matches!(result, Err(DeployError::UnknownType { .. })));
    assert_eq!(
        deployer.cell_status(&cell_id("broken")).await,
        Some(CellStatus::Failed)
    );
}
