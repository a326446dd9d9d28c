mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use common::{orchestrator, test_config, FakeRuntime, RunBehavior};
use pysandbox_orchestrator::runtime::ContainerRole;
use pysandbox_orchestrator::script::{script_path, state_path};
use pysandbox_orchestrator::{ExecutionRequest, ExecutionResult, SandboxError};

#[tokio::test]
async fn test_blocked_import_never_touches_runtime() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(test_config(), &runtime);

    let err = engine
        .execute_transient("import os\nprint(os.getcwd())", None)
        .await
        .unwrap_err();

    match err {
        SandboxError::PolicyViolation { module, .. } => assert_eq!(module, "os"),
        other => panic!("expected policy violation, got {:?}", other),
    }
    assert_eq!(runtime.created_count(), 0);

    let err = engine
        .execute_persistent(Some("s1"), "import subprocess")
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::PolicyViolation { .. }));
    assert_eq!(runtime.created_count(), 0);
    assert!(engine.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_output_document_fields() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::document(json!({
        "x": 1,
        "__stdout__": "hi\n",
        "__stderr__": "",
        "__error__": null,
    })));
    let engine = orchestrator(test_config(), &runtime);

    let result = engine.execute_transient("x = 1\nprint('hi')", None).await.unwrap();

    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.error, None);
    assert_eq!(result.result, None);
    assert_eq!(Value::Object(result.state), json!({"x": 1}));
}

#[tokio::test]
async fn test_state_and_script_are_copied_in() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(test_config(), &runtime);

    let mut state = Map::new();
    state.insert("counter".to_string(), json!(41));
    engine
        .execute_transient("counter += 1", Some(state))
        .await
        .unwrap();

    let container_id = runtime.created_with_role(ContainerRole::Pool).remove(0);
    let wd = &engine.config().docker.working_dir;

    let state_doc = runtime.file(&container_id, &state_path(wd)).unwrap();
    assert_eq!(
        serde_json::from_slice::<Value>(&state_doc).unwrap(),
        json!({"counter": 41})
    );

    let script = String::from_utf8(runtime.file(&container_id, &script_path(wd)).unwrap()).unwrap();
    assert!(script.contains("counter += 1"));
}

#[tokio::test]
async fn test_code_error_is_reported_in_result() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::document(json!({
        "__stdout__": "",
        "__stderr__": "",
        "__error__": "division by zero",
    })));
    let engine = orchestrator(test_config(), &runtime);

    let result = engine.execute_transient("1 / 0", None).await.unwrap();
    assert_eq!(result.error.as_deref(), Some("division by zero"));
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_result_variable_is_surfaced() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::document(json!({
        "result": 120,
        "__stdout__": "",
        "__stderr__": "",
        "__error__": null,
    })));
    let engine = orchestrator(test_config(), &runtime);

    let outcome = engine
        .execute(ExecutionRequest::transient(
            "import math\nresult = math.factorial(5)",
            None,
        ))
        .await
        .unwrap();

    let ExecutionResult::Transient(result) = outcome else {
        panic!("expected transient result");
    };
    assert_eq!(result.result, Some(json!(120)));
    assert_eq!(result.state.get("result"), Some(&json!(120)));
}

#[tokio::test]
async fn test_nonzero_exit_returns_logs_and_releases() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::Exit {
        code: 137,
        output: None,
        logs: "Killed".to_string(),
    });
    let engine = orchestrator(test_config(), &runtime);

    let err = engine.execute_transient("x = [0] * 10**10", None).await.unwrap_err();
    match err {
        SandboxError::ExecutionError { exit_code, output } => {
            assert_eq!(exit_code, 137);
            assert_eq!(output, "Killed");
        }
        other => panic!("expected execution error, got {:?}", other),
    }
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_missing_output_document() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::Exit {
        code: 0,
        output: None,
        logs: String::new(),
    });
    let engine = orchestrator(test_config(), &runtime);

    let err = engine.execute_transient("pass", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::OutputMissing));
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_non_object_output_document() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::document(json!([1, 2, 3])));
    let engine = orchestrator(test_config(), &runtime);

    let err = engine.execute_transient("pass", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::OutputParseError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_kills_and_removes_container() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::Hang);

    let mut config = test_config();
    config.docker.timeout = 2;
    let engine = orchestrator(config, &runtime);

    let started = tokio::time::Instant::now();
    let err = engine.execute_transient("while True: pass", None).await.unwrap_err();

    assert!(matches!(err, SandboxError::Timeout(2)));
    assert!(started.elapsed() >= Duration::from_secs(2));

    let container_id = runtime.created_with_role(ContainerRole::Pool).remove(0);
    assert_eq!(runtime.killed(), vec![container_id.clone()]);
    assert_eq!(runtime.removed(), vec![container_id]);
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_execution_releases_container() {
    let runtime = FakeRuntime::new();
    runtime.set_run_behavior(RunBehavior::Hang);

    let mut config = test_config();
    config.docker.timeout = 30;
    let engine = orchestrator(config, &runtime);

    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        engine.execute_transient("while True: pass", None),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(runtime.created_with_role(ContainerRole::Pool).len(), 1);

    engine.shutdown().await;

    let container_id = runtime.created_with_role(ContainerRole::Pool).remove(0);
    assert_eq!(runtime.removed(), vec![container_id]);
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_creation_failure_surfaces() {
    let runtime = FakeRuntime::new();
    runtime.set_fail_create(true);
    let engine = orchestrator(test_config(), &runtime);

    let err = engine.execute_transient("x = 1", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::CreationFailure(_)));
}

#[tokio::test]
async fn test_every_transient_container_is_released() {
    let runtime = FakeRuntime::new();
    let engine = orchestrator(test_config(), &runtime);

    for i in 0..5 {
        engine
            .execute_transient(&format!("x = {}", i), None)
            .await
            .unwrap();
    }

    assert_eq!(runtime.created_count(), 5);
    assert_eq!(runtime.removed().len(), 5);
    assert_eq!(runtime.live_containers(), 0);
}
