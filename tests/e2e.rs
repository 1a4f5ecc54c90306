//! End-to-end integration tests for kustomux.
//!
//! Each test spawns real downstream child processes running the
//! `mock-kusto-mcp` fixture binary, so the full path is exercised:
//! spawn, MCP handshake over the child's stdio, tool discovery, schema
//! rewriting, dispatch, fan-out aggregation, and supervision.

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolResult, JsonObject};

use kustomux::config::{Cli, Config};
use kustomux::events::{EndpointEvent, EndpointEventSender};
use kustomux::health::HealthLoop;
use kustomux::router::Router;
use kustomux::schema::SharedCatalog;
use kustomux::supervisor::{EndpointState, Supervisor};

const C1: &str = "https://c1.example";
const C2: &str = "https://c2.example";

/// Build a config whose downstream command is the mock fixture binary.
fn mock_config(mappings: &[&str]) -> Config {
    let mut args = vec![
        "kustomux".to_string(),
        "--server-command".to_string(),
        env!("CARGO_BIN_EXE_mock-kusto-mcp").to_string(),
        // keep the ticker out of the way; tests drive pings explicitly
        "--ping-interval".to_string(),
        "3600".to_string(),
        "--ping-timeout".to_string(),
        "5".to_string(),
    ];
    for mapping in mappings {
        args.push("--mapping".to_string());
        args.push(mapping.to_string());
    }
    let cli = Cli::try_parse_from(args).expect("test CLI must parse");
    Config::from_cli(cli).expect("test config must resolve")
}

/// Bring up the standard two-cluster fleet and a refreshed catalog.
async fn start_fleet() -> (Config, Arc<Supervisor>, SharedCatalog, Router) {
    let config = mock_config(&[&format!("{C1}=id-one"), C2]);
    let supervisor = Arc::new(Supervisor::new(&config, EndpointEventSender::default()));

    let connected = supervisor.init_all(&config.mappings).await;
    assert_eq!(connected, 2, "both mock clusters should connect");

    let catalog = SharedCatalog::new();
    let tool_count = catalog.refresh_from(&supervisor).await;
    assert!(tool_count > 0, "mock clusters expose tools");

    let router = Router::new(supervisor.clone(), catalog.clone());
    (config, supervisor, catalog, router)
}

fn text_items(result: &CallToolResult) -> Vec<String> {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect()
}

fn parse_echo(text: &str) -> Value {
    serde_json::from_str(text).expect("mock echo must be JSON")
}

async fn wait_for_state(
    supervisor: &Supervisor,
    url: &str,
    state: EndpointState,
    timeout: Duration,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(status) = supervisor.status(url).await {
            if status.state == state {
                return Ok(());
            }
        }
        if start.elapsed() > timeout {
            anyhow::bail!("timeout waiting for {url} to become {state:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Initialization & discovery
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_init_connects_all_clusters() {
    let (_config, supervisor, _catalog, _router) = start_fleet().await;

    let statuses = supervisor.statuses().await;
    assert_eq!(statuses.len(), 2);
    for status in &statuses {
        assert_eq!(status.state, EndpointState::Connected, "{}", status.url);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_heartbeat.is_some());
        assert_eq!(status.tool_count, 2);
    }
    assert_eq!(statuses[0].identity, "id-one");
    assert_eq!(statuses[1].identity, "");

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_mappings_collapse() {
    let config = mock_config(&[&format!("{C1}=first"), "https://C1.EXAMPLE/=second"]);
    let supervisor = Arc::new(Supervisor::new(&config, EndpointEventSender::default()));

    let connected = supervisor.init_all(&config.mappings).await;
    assert_eq!(connected, 1);
    assert_eq!(supervisor.endpoint_urls().await, vec![C1.to_string()]);

    // the first mapping's identity wins
    let status = supervisor.status(C1).await.unwrap();
    assert_eq!(status.identity, "first");

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_init_is_non_fatal() {
    let config = mock_config(&[&format!("{C1}=id-one"), &format!("{C2}=fail-start")]);
    let supervisor = Arc::new(Supervisor::new(&config, EndpointEventSender::default()));

    let connected = supervisor.init_all(&config.mappings).await;
    assert_eq!(connected, 1);

    assert_eq!(
        supervisor.status(C1).await.unwrap().state,
        EndpointState::Connected
    );
    assert_eq!(
        supervisor.status(C2).await.unwrap().state,
        EndpointState::Failed
    );

    // the catalog still builds from the surviving cluster
    let catalog = SharedCatalog::new();
    assert!(catalog.refresh_from(&supervisor).await > 0);

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_catalog_classification_and_enum() {
    let (_config, supervisor, catalog, _router) = start_fleet().await;

    let snapshot = catalog.load();
    assert!(snapshot.is_routable("kusto_query"));
    assert!(snapshot.is_fan_out("kusto_cluster_list"));

    let query = snapshot
        .merged()
        .iter()
        .find(|t| t.name == "kusto_query")
        .unwrap();
    let schema = &query.input_schema;
    assert_eq!(
        schema["properties"]["cluster"]["enum"],
        serde_json::json!([C1, C2])
    );
    assert!(schema["required"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("cluster")));

    let list = snapshot
        .merged()
        .iter()
        .find(|t| t.name == "kusto_cluster_list")
        .unwrap();
    let schema = &list.input_schema;
    assert_eq!(
        schema["properties"]["cluster"]["enum"],
        serde_json::json!([C1, C2])
    );
    let required = schema.get("required").and_then(Value::as_array);
    assert!(required.map_or(true, |r| !r.contains(&serde_json::json!("cluster"))));

    supervisor.shutdown_all().await;
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_route_to_one_keeps_cluster_and_passes_identity() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let args = serde_json::json!({
        "cluster": "https://C1.EXAMPLE/",
        "database": "d",
        "query": "Q"
    });
    let result = router
        .dispatch("kusto_query", args.as_object().cloned())
        .await;

    assert_ne!(result.is_error, Some(true));
    let texts = text_items(&result);
    assert_eq!(texts.len(), 1);
    let echo = parse_echo(&texts[0]);

    assert_eq!(echo["tool"], "kusto_query");
    // the caller's original cluster value reaches the downstream unchanged
    assert_eq!(echo["args"]["cluster"], "https://C1.EXAMPLE/");
    assert_eq!(echo["args"]["database"], "d");
    assert_eq!(echo["identity"], "id-one");
    assert_eq!(echo["readOnly"], true);
    assert!(!echo["tokenCredentials"].as_str().unwrap().is_empty());

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_with_cluster_strips_argument() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let args = serde_json::json!({"cluster": C2, "subscriptionId": "s"});
    let result = router
        .dispatch("kusto_cluster_list", args.as_object().cloned())
        .await;

    assert_ne!(result.is_error, Some(true));
    let texts = text_items(&result);
    assert_eq!(texts.len(), 1, "a forced cluster gets exactly one result");
    let echo = parse_echo(&texts[0]);

    assert_eq!(echo["identity"], "");
    assert!(echo["args"].get("cluster").is_none());
    assert_eq!(echo["args"]["subscriptionId"], "s");

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_merges_all_clusters() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let args = serde_json::json!({"subscriptionId": "s"});
    let result = router
        .dispatch("kusto_cluster_list", args.as_object().cloned())
        .await;

    assert_ne!(result.is_error, Some(true));
    let texts = text_items(&result);
    assert_eq!(texts.len(), 2, "one content item per connected cluster");

    let identities: Vec<String> = texts
        .iter()
        .map(|t| parse_echo(t)["identity"].as_str().unwrap().to_string())
        .collect();
    // stable order by cluster URL: c1 (id-one) before c2 (empty identity)
    assert_eq!(identities, vec!["id-one".to_string(), String::new()]);

    for text in &texts {
        assert!(parse_echo(text)["args"].get("cluster").is_none());
    }

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_aggregates_errors() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let args = serde_json::json!({"subscriptionId": "s", "fail": true});
    let result = router
        .dispatch("kusto_cluster_list", args.as_object().cloned())
        .await;

    assert_eq!(result.is_error, Some(true));
    let texts = text_items(&result);
    assert_eq!(texts.len(), 2);
    assert!(texts[0].starts_with(&format!("[{C1}]")));
    assert!(texts[1].starts_with(&format!("[{C2}]")));
    assert!(texts[0].contains("mock failure"));

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_tool_without_cluster() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let result = router.dispatch("mystery", Some(JsonObject::new())).await;

    assert_eq!(result.is_error, Some(true));
    let text = text_items(&result).join("\n");
    assert!(text.contains("Unknown tool \"mystery\""));
    assert!(text.contains("kusto_query"));

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_cluster_is_rejected() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    let args = serde_json::json!({
        "cluster": "https://other.example",
        "database": "d",
        "query": "Q"
    });
    let result = router
        .dispatch("kusto_query", args.as_object().cloned())
        .await;

    assert_eq!(result.is_error, Some(true));
    let text = text_items(&result).join("\n");
    assert!(text.contains("not configured"));
    assert!(text.contains(C1));

    supervisor.shutdown_all().await;
}

// ============================================================================
// Supervision
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_refreshes_heartbeat() {
    let (_config, supervisor, _catalog, _router) = start_fleet().await;

    let before = supervisor.status(C1).await.unwrap().last_heartbeat.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(supervisor.ping(C1).await);
    let after = supervisor.status(C1).await.unwrap();
    assert!(after.last_heartbeat.unwrap() > before);
    assert_eq!(after.consecutive_failures, 0);

    // pinging something unknown never succeeds
    assert!(!supervisor.ping("https://nowhere.example").await);

    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_exit_triggers_reconnect() {
    let (config, supervisor, _catalog, router) = start_fleet().await;
    let mut events = supervisor.subscribe();

    let health = HealthLoop::new(supervisor.clone(), &config);
    health.start();

    // make the c1 child die mid-call
    let args = serde_json::json!({
        "cluster": C1,
        "database": "d",
        "query": "Q",
        "crash": true
    });
    let result = router
        .dispatch("kusto_query", args.as_object().cloned())
        .await;
    assert_eq!(result.is_error, Some(true), "call to a dying child fails");

    // the supervisor announces the exit exactly once
    let exited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(EndpointEvent::ChildExited { cluster }) => break cluster,
                Some(_) => continue,
                None => panic!("event channel closed before child exit"),
            }
        }
    })
    .await
    .expect("child exit event");
    assert_eq!(exited, C1);

    // backoff starts at 1s, so the cluster should come back quickly
    wait_for_state(&supervisor, C1, EndpointState::Connected, Duration::from_secs(15))
        .await
        .expect("cluster reconnects after child exit");

    let status = supervisor.status(C1).await.unwrap();
    assert_eq!(status.consecutive_failures, 0);

    // the revived child serves calls again
    let args = serde_json::json!({"cluster": C1, "database": "d", "query": "Q"});
    let result = router
        .dispatch("kusto_query", args.as_object().cloned())
        .await;
    assert_ne!(result.is_error, Some(true));

    health.stop();
    supervisor.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_all_clears_fleet() {
    let (_config, supervisor, _catalog, router) = start_fleet().await;

    supervisor.shutdown_all().await;
    assert!(supervisor.statuses().await.is_empty());
    assert_eq!(supervisor.connected_count().await, 0);

    let result = router
        .dispatch(
            "kusto_cluster_list",
            serde_json::json!({}).as_object().cloned(),
        )
        .await;
    assert_eq!(result.is_error, Some(true));
    let text = text_items(&result).join("\n");
    assert!(text.contains("No clusters connected"));
}
