//! End-to-end tests for the engine: catalog → preflight → executor →
//! runner or helper → parser → audit log, with real processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use caretaker_lib::audit::{compute_hash, AuditQuery, AuditStore, OutputBlobStore, RunStatus, GENESIS_HASH};
use caretaker_lib::capability::catalog::{CapabilityCatalog, CatalogError};
use caretaker_lib::config::RunnerSettings;
use caretaker_lib::executor::{ExecutionServices, Executor, UserExecutor};
use caretaker_lib::helper::service::RunnerFactory;
use caretaker_lib::helper::{
    HelperClient, HelperHealth, HelperService, InProcessHelper, LocalAuthority, RemoteExecutor,
};
use caretaker_lib::parser::{ParsedOutput, PressureLevel};
use caretaker_lib::permissions::{Permission, RecordingRemediator, StaticPermissions};
use caretaker_lib::preflight::mock::FakeProbe;
use caretaker_lib::preflight::PreflightValidator;
use caretaker_lib::runner::mock::MockRunner;
use caretaker_lib::runner::{CommandRunner, ExecutionStatus, OutputSink, ProcessRunner};
use caretaker_lib::{Engine, EngineError, EngineServices};

fn fixture_catalog() -> Arc<CapabilityCatalog> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/capabilities.json");
    Arc::new(CapabilityCatalog::load(&path).unwrap())
}

fn runner_settings() -> RunnerSettings {
    RunnerSettings {
        termination_grace_ms: 500,
        drain_timeout_ms: 500,
        ..Default::default()
    }
}

fn process_runner() -> Arc<dyn CommandRunner> {
    Arc::new(ProcessRunner::new(&runner_settings()))
}

struct Harness {
    dir: tempfile::TempDir,
    engine: Arc<Engine>,
    audit: Arc<AuditStore>,
}

impl Harness {
    fn outputs(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }
}

fn harness_with(
    runner: Arc<dyn CommandRunner>,
    remote: impl FnOnce(&LocalAuthority) -> Arc<dyn RemoteExecutor>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(
        AuditStore::open(&dir.path().join("audit.db"), &dir.path().join("exports")).unwrap(),
    );
    let authority = LocalAuthority::generate(Duration::from_secs(30));
    let remote = remote(&authority);

    let engine = Engine::new(EngineServices {
        catalog: fixture_catalog(),
        permissions: Arc::new(StaticPermissions::granted(Permission::Administrator)),
        remediator: Arc::new(RecordingRemediator::new()),
        probe: Arc::new(FakeProbe::new()),
        runner,
        remote,
        authorizer: Arc::new(authority),
        audit: audit.clone(),
        blobs: OutputBlobStore::new(dir.path().join("outputs")),
    });
    Harness {
        dir,
        engine: Arc::new(engine),
        audit,
    }
}

/// Helper running real processes in-process.
fn in_process_helper(authority: &LocalAuthority) -> Arc<InProcessHelper> {
    let factory: RunnerFactory = Arc::new(process_runner);
    let service = HelperService::new(factory, authority.verifier(), Duration::from_secs(60));
    Arc::new(InProcessHelper::new(Arc::new(service)))
}

fn harness() -> Harness {
    harness_with(process_runner(), |a| in_process_helper(a) as Arc<dyn RemoteExecutor>)
}

fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =========================================================================
// Catalog
// =========================================================================

#[test]
fn duplicate_id_fails_the_whole_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capabilities.json");
    let entry = serde_json::json!({
        "id": "diag.echo",
        "title": "Echo",
        "group": "diagnostics",
        "commandTemplate": "/bin/echo hi",
        "timeout": 5,
        "privilegeLevel": "user",
        "riskClass": "safe"
    });
    std::fs::write(&path, serde_json::to_vec(&vec![entry.clone(), entry]).unwrap()).unwrap();

    match CapabilityCatalog::load(&path) {
        Err(CatalogError::DuplicateId(id)) => assert_eq!(id, "diag.echo"),
        other => panic!("expected duplicate id error, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn fixture_catalog_indexes_groups() {
    let catalog = fixture_catalog();
    assert!(catalog.lookup("diag.mem.pressure").is_some());
    assert_eq!(catalog.by_group("quick").len(), 2);
    let hits: Vec<String> = catalog.search("MEMORY").iter().map(|c| c.id.clone()).collect();
    assert_eq!(hits, vec!["diag.mem.pressure", "quick.mem.purge"]);
}

// =========================================================================
// Validation gates
// =========================================================================

#[tokio::test]
async fn unresolved_placeholder_never_spawns() {
    let runner = Arc::new(MockRunner::new());
    let h = harness_with(runner.clone(), |a| in_process_helper(a) as Arc<dyn RemoteExecutor>);

    let err = h.engine.execute("diag.echo", &HashMap::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Template(_)));
    assert_eq!(runner.call_count(), 0);
    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RunStatus::Rejected);
    assert_eq!(records[0].output_size_bytes, 0);
}

#[tokio::test]
async fn user_executor_refuses_elevated_capability() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let services = Arc::new(ExecutionServices {
        preflight: Arc::new(PreflightValidator::new(
            Arc::new(StaticPermissions::new()),
            Arc::new(FakeProbe::new()),
        )),
        remediator: Arc::new(RecordingRemediator::new()),
        audit: Arc::new(
            AuditStore::open(&dir.path().join("audit.db"), &dir.path().join("exports")).unwrap(),
        ),
        blobs: OutputBlobStore::new(dir.path().join("outputs")),
    });
    let executor = UserExecutor::new(services, runner.clone());
    let purge = fixture_catalog().lookup("quick.mem.purge").unwrap();

    let err = executor
        .execute(&purge, &HashMap::new(), OutputSink::none())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "privilege_mismatch");
    assert!(!runner.was_called());
}

#[tokio::test]
async fn unknown_and_automation_capabilities_are_audited_rejections() {
    let h = harness();

    let err = h.engine.execute("diag.nope", &HashMap::new()).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_capability");
    let err = h
        .engine
        .execute("auto.safari.tabs", &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "no_executor_for_tier");

    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == RunStatus::Rejected));
}

// =========================================================================
// Process outcomes
// =========================================================================

#[tokio::test]
async fn completion_reports_real_exit_codes() {
    let h = harness();

    let ok = h
        .engine
        .execute("diag.echo", &args(&[("message", "hello world; rm -rf /")]))
        .await
        .unwrap();
    assert_eq!(ok.status, ExecutionStatus::Success);
    assert_eq!(ok.exit_code, Some(0));
    assert_eq!(ok.stdout, "hello world; rm -rf /\n");

    let failed = h.engine.execute("diag.fail", &HashMap::new()).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.exit_code, Some(7));
    assert_eq!(failed.stderr, "failing\n");
}

#[tokio::test]
async fn timeout_terminates_within_bound() {
    let h = harness();
    let started = Instant::now();

    let result = h
        .engine
        .execute("proc.sleep.short", &args(&[("seconds", "30")]))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.exit_code, Some(128 + 15));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);

    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records[0].status, RunStatus::Timeout);
}

#[tokio::test]
async fn cancel_yields_cancelled() {
    let h = harness();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .execute("proc.sleep.long", &args(&[("seconds", "30")]))
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.engine.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.exit_code.is_some());
    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records[0].status, RunStatus::Cancelled);
}

#[tokio::test]
async fn output_streams_to_callbacks() {
    let h = harness();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let seen = lines.clone();
    let sink = OutputSink {
        on_stdout: Some(Arc::new(move |line: &str| {
            seen.lock().unwrap().push(line.to_string());
        })),
        on_stderr: None,
    };

    let result = h
        .engine
        .execute_with("diag.table", &HashMap::new(), sink)
        .await
        .unwrap();

    assert_eq!(*lines.lock().unwrap(), vec!["NAME SIZE", "alpha 1", "beta 2"]);
    match result.parsed_output {
        Some(ParsedOutput::Table(table)) => {
            assert_eq!(table.headers, vec!["NAME", "SIZE"]);
            assert_eq!(table.rows.len(), 2);
        }
        other => panic!("expected table, got {:?}", other),
    }
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn memory_pressure_probe_is_parsed() {
    let h = harness();
    let result = h.engine.execute("diag.mem.pressure", &HashMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    match result.parsed_output {
        Some(ParsedOutput::MemoryPressure(mp)) => {
            assert_eq!(mp.level, PressureLevel::Warn);
            assert_eq!(mp.level.as_str(), "warn");
            assert_eq!(mp.free_percentage, Some(45.0));
        }
        other => panic!("expected memory pressure, got {:?}", other),
    }
}

#[tokio::test]
async fn purge_without_helper_fails_before_any_rpc() {
    let missing = tempfile::tempdir().unwrap();
    let socket = missing.path().join("helper.sock");
    let binary = missing.path().join("caretaker-helper");
    let h = harness_with(process_runner(), |_| {
        Arc::new(HelperClient::new(socket.clone(), binary.clone(), "0.4.0")) as Arc<dyn RemoteExecutor>
    });

    let err = h.engine.execute("quick.mem.purge", &HashMap::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::HelperNotInstalled));
    assert_eq!(err.kind(), "helper_not_installed");
    assert!(!socket.exists());
    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records[0].status, RunStatus::Error);
}

#[tokio::test]
async fn purge_with_forced_not_installed_makes_zero_rpcs() {
    let helper = Arc::new(Mutex::new(None::<Arc<InProcessHelper>>));
    let slot = helper.clone();
    let h = harness_with(process_runner(), move |a| {
        let factory: RunnerFactory = Arc::new(process_runner);
        let service = HelperService::new(factory, a.verifier(), Duration::from_secs(60));
        let remote = Arc::new(
            InProcessHelper::new(Arc::new(service)).with_health(HelperHealth::NotInstalled),
        );
        *slot.lock().unwrap() = Some(remote.clone());
        remote as Arc<dyn RemoteExecutor>
    });

    let err = h.engine.execute("quick.mem.purge", &HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::HelperNotInstalled));
    let remote = helper.lock().unwrap().clone().unwrap();
    assert_eq!(remote.rpc_calls(), 0);
}

#[tokio::test]
async fn elevated_capability_runs_through_helper() {
    let h = harness();
    let result = h
        .engine
        .execute("quick.cache.flush", &args(&[("scope", "user caches")]))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "flushed user caches\n");
    let records = h.engine.query_audit_log(&AuditQuery::default()).unwrap();
    assert_eq!(records[0].capability_id, "quick.cache.flush");
    assert_eq!(records[0].arguments.get("scope").unwrap(), "user caches");
}

#[tokio::test]
async fn repeated_runs_chain_and_get_distinct_output_files() {
    let h = harness();
    let message = args(&[("message", "same bytes")]);
    let first = h.engine.execute("diag.echo", &message).await.unwrap();
    let second = h.engine.execute("diag.echo", &message).await.unwrap();
    assert_eq!(first.stdout, second.stdout);

    let records = h.audit.all().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].previous_hash, GENESIS_HASH);
    assert_eq!(records[1].previous_hash, records[0].own_hash);
    for record in &records {
        assert_eq!(compute_hash(record).unwrap(), record.own_hash);
    }

    let a = records[0].stdout_path.clone().unwrap();
    let b = records[1].stdout_path.clone().unwrap();
    assert_ne!(a, b);
    assert!(Path::new(&a).starts_with(h.outputs()));
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());

    let verification = h.engine.verify_audit_log().unwrap();
    assert!(verification.valid);
    assert_eq!(verification.records_checked, 2);
}

#[tokio::test]
async fn every_outcome_is_logged_and_chain_holds() {
    let h = harness();
    let _ = h.engine.execute("diag.echo", &args(&[("message", "x")])).await;
    let _ = h.engine.execute("diag.fail", &HashMap::new()).await;
    let _ = h.engine.execute("diag.echo", &HashMap::new()).await;
    let _ = h
        .engine
        .execute("proc.sleep.short", &args(&[("seconds", "10")]))
        .await;

    let records = h.audit.all().unwrap();
    let statuses: Vec<RunStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Rejected,
            RunStatus::Timeout
        ]
    );
    assert!(h.engine.verify_audit_log().unwrap().valid);

    let by_capability = h
        .engine
        .query_audit_log(&AuditQuery {
            capability_id: Some("diag.echo".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_capability.len(), 2);
}

#[tokio::test]
async fn export_writes_records_in_range() {
    let h = harness();
    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    h.engine
        .execute("diag.echo", &args(&[("message", "exported")]))
        .await
        .unwrap();
    let after = chrono::Utc::now() + chrono::Duration::seconds(1);

    let path = h.engine.export_audit_log(before, after).unwrap();
    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(document["records"].as_array().unwrap().len(), 1);
    assert_eq!(document["records"][0]["capabilityId"], "diag.echo");
    assert_eq!(document["chain"]["valid"], true);

    assert!(h.engine.export_audit_log(after, before).is_err());
}
