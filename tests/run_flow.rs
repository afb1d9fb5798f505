//! End-to-end coordinator runs against an in-process plugin endpoint
//! registered as a `remote` catalog entry.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use exec_plugin::message::code;
use exec_plugin::plugin_test_util::{
    happy_script, MockBehavior, MockPlugin, RecordingSink, SinkEvent,
};
use exec_plugin::PluginServer;
use gantry::catalog::{Catalog, PluginDescriptor, PluginKind};
use gantry::executor::{execute_plugin, RunOutcome};

async fn catalog_with_mock(behavior: MockBehavior) -> (Catalog, CancellationToken) {
    let server = PluginServer::bind(0).await.unwrap();
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
    let shutdown = server.shutdown_token();
    tokio::spawn(server.serve(MockPlugin::new(behavior)));

    let descriptor = PluginDescriptor {
        kind: PluginKind::Remote,
        address: addr,
        description: "canned endpoint".into(),
        ..Default::default()
    };
    let catalog = Catalog::new(HashMap::from([("mock".to_string(), descriptor)]));
    (catalog, shutdown)
}

#[tokio::test]
async fn happy_run_completes_with_a_successful_summary() {
    let (catalog, shutdown) = catalog_with_mock(MockBehavior::Script(happy_script())).await;

    let mut sink = RecordingSink::new();
    let report = execute_plugin(
        CancellationToken::new(),
        &catalog,
        "mock",
        HashMap::new(),
        &mut sink,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(sink.outputs(), vec!["hello from mock"]);
    assert!(sink
        .events
        .iter()
        .any(|e| matches!(e, SinkEvent::Progress(_))));

    let summary = report.summary.expect("summary reported");
    assert!(summary.success);
    assert!(summary.error.is_none());
    assert!(summary.duration_ms >= 0.0);
    assert_eq!(summary.metadata.get("plugin_type").unwrap(), "remote");
    assert!(summary.metrics.contains_key("execution_time_ms"));
    // defaults were merged into the params that became metadata
    assert_eq!(summary.metadata.get("language").unwrap(), "en");
    assert_eq!(summary.metadata.get("message").unwrap(), "World");

    shutdown.cancel();
}

#[tokio::test]
async fn schema_rejection_fails_before_any_output() {
    let (catalog, shutdown) = catalog_with_mock(MockBehavior::Script(happy_script())).await;

    let params = HashMap::from([("language".to_string(), "jp".to_string())]);
    let mut sink = RecordingSink::new();
    let report = execute_plugin(CancellationToken::new(), &catalog, "mock", params, &mut sink)
        .await
        .unwrap();

    match &report.outcome {
        RunOutcome::Failed { surfaced, .. } => assert!(*surfaced),
        other => panic!("expected a surfaced failure, got {other:?}"),
    }
    assert!(sink.outputs().is_empty());
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, code::INVALID_PARAMETERS);
    assert!(errors[0].1.contains("jp"));

    let summary = report.summary.expect("summary reported");
    assert!(!summary.success);
    assert!(summary.error.is_some());

    shutdown.cancel();
}

#[tokio::test]
async fn cancelled_run_is_not_a_failure() {
    let (catalog, shutdown) = catalog_with_mock(MockBehavior::RunUntilCancelled {
        tick: Duration::from_millis(30),
        max_ticks: 300,
    })
    .await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        canceller.cancel();
    });

    let mut sink = RecordingSink::new();
    let report = execute_plugin(cancel, &catalog, "mock", HashMap::new(), &mut sink)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    match sink.events.last() {
        Some(SinkEvent::Error { code, .. }) => assert_eq!(code, code::CANCELLED),
        other => panic!("expected a CANCELLED frame last, got {other:?}"),
    }
    let summary = report.summary.expect("summary reported");
    assert!(!summary.success);

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_plugin_is_a_config_error() {
    let catalog = Catalog::default();
    let mut sink = RecordingSink::new();
    let err = execute_plugin(
        CancellationToken::new(),
        &catalog,
        "missing",
        HashMap::new(),
        &mut sink,
    )
    .await
    .expect_err("lookup must fail");
    assert!(err.to_string().contains("missing"));
    assert!(sink.events.is_empty());
}

#[tokio::test]
async fn execution_error_is_surfaced_and_summarised() {
    let (catalog, shutdown) =
        catalog_with_mock(MockBehavior::FailWith("kaput".into())).await;

    let mut sink = RecordingSink::new();
    let report = execute_plugin(
        CancellationToken::new(),
        &catalog,
        "mock",
        HashMap::new(),
        &mut sink,
    )
    .await
    .unwrap();

    match &report.outcome {
        RunOutcome::Failed { surfaced, message } => {
            assert!(*surfaced);
            assert!(message.contains("kaput"));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, code::EXECUTION_ERROR);

    let summary = report.summary.expect("summary reported");
    assert!(!summary.success);
    assert!(summary.error.as_deref().unwrap_or_default().contains("kaput"));

    shutdown.cancel();
}
