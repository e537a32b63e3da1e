use std::{sync::Arc, time::Duration};

use comfy_pilot::{
    apps::{App, AppOptions},
    config::{BridgeSettings, ConfigManager, MapConfigManager, LISTEN_KEY, TIMEOUT_KEY},
    graph::InMemoryGraph,
};
use pilot_bridge::{
    HistoryEntry, Namespace, RequestKind,
    test_util::FakeExecutionService,
};
use pilot_ws::BridgeClient;
use serde_json::{Value, json};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

async fn settings(timeout_secs: &str) -> BridgeSettings {
    let config = ConfigManager(MapConfigManager::from_pairs([
        (LISTEN_KEY, "127.0.0.1:0"),
        (TIMEOUT_KEY, timeout_secs),
    ]));
    BridgeSettings::load(&config).await.unwrap()
}

async fn start(timeout_secs: &str) -> (App, Arc<FakeExecutionService>, BridgeClient) {
    let service = Arc::new(FakeExecutionService::new());
    let mut app = App::new();
    app.bootstrap_with(AppOptions::new(settings(timeout_secs).await), service.clone())
        .await
        .unwrap();
    let url = app.url().unwrap();
    let client = BridgeClient::connect(&url, Namespace::default(), None)
        .await
        .unwrap();
    (app, service, client)
}

async fn wait_for_subscribers(service: &FakeExecutionService, count: usize) {
    for _ in 0..500 {
        if service.subscriber_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} execution subscribers, found {}",
        service.subscriber_count()
    );
}

fn history(outputs: Value) -> HistoryEntry {
    serde_json::from_value(json!({"outputs": outputs, "status": {"status_str": "success"}})).unwrap()
}

#[tokio::test]
async fn successful_execution_returns_image_urls() {
    let (mut app, service, client) = start("300").await;
    let client = Arc::new(client);
    service.set_history(
        "p1",
        history(json!({"9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}})),
    );

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(RequestKind::ExecuteWorkflow, None, CALL_TIMEOUT)
                .await
        })
    };
    wait_for_subscribers(&service, 1).await;
    service.succeed("p1");

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.kind, "comfy-pilot:execution-result");
    assert_eq!(reply.payload["success"], json!(true));
    assert_eq!(
        reply.payload["outputs"]["9"]["images"][0],
        json!({
            "filename": "out.png",
            "subfolder": "",
            "type": "output",
            "url": "/view?filename=out.png&subfolder=&type=output"
        })
    );
    wait_for_subscribers(&service, 0).await;
    app.shutdown().await;
}

#[tokio::test]
async fn concurrent_executions_only_finish_their_own_prompt() {
    let (mut app, service, client) = start("300").await;
    let client = Arc::new(client);
    service.set_history("p1", HistoryEntry::default());

    let spawn_call = |client: Arc<BridgeClient>| {
        tokio::spawn(async move {
            client
                .call(RequestKind::ExecuteWorkflow, None, CALL_TIMEOUT)
                .await
        })
    };
    let first = spawn_call(client.clone());
    wait_for_subscribers(&service, 1).await;
    let second = spawn_call(client.clone());
    wait_for_subscribers(&service, 2).await;

    service.succeed("p1");
    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply.payload["promptId"], json!("p1"));
    assert_eq!(reply.payload["success"], json!(true));

    let router = app.router().unwrap();
    let pending = router.monitor().handles();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].prompt_id(), Some("p2"));
    assert!(!second.is_finished());

    // shutdown answers the one still waiting
    app.shutdown().await;
    let reply = second.await.unwrap().unwrap();
    assert_eq!(
        reply.payload,
        json!({"success": false, "promptId": "p2", "error": "cancelled"})
    );
}

#[tokio::test]
async fn execution_without_outcome_times_out_once() {
    let (mut app, service, client) = start("1").await;
    let mut stray = client.subscribe();

    let reply = client
        .call(RequestKind::ExecuteWorkflow, None, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        reply.payload,
        json!({"success": false, "promptId": "p1", "error": "timeout"})
    );

    wait_for_subscribers(&service, 0).await;
    assert_eq!(service.succeed("p1"), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(stray.try_recv().is_err());
    app.shutdown().await;
}

#[tokio::test]
async fn graph_edits_reach_controllers() {
    let (mut app, _service, client) = start("300").await;
    let mut notifications = client.subscribe();
    let graph: Arc<InMemoryGraph> = app.graph();

    // registered once a round trip has completed
    client.call(RequestKind::Ping, None, CALL_TIMEOUT).await.unwrap();

    graph.add_node(json!({"type": "KSampler"})).unwrap();
    let changed = tokio::time::timeout(CALL_TIMEOUT, notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(changed.kind, "comfy-pilot:workflow-changed");
    assert_eq!(changed.payload["nodes"][0]["type"], json!("KSampler"));

    graph.add_tab("second", json!({"nodes": []})).unwrap();
    let tab = tokio::time::timeout(CALL_TIMEOUT, notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tab.kind, "comfy-pilot:tab-changed");
    assert_eq!(tab.payload, json!({"nodes": []}));

    let reply = client
        .call(RequestKind::GetWorkflow, None, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply.payload, json!({"nodes": []}));
    app.shutdown().await;
}

#[tokio::test]
async fn new_workflow_then_get_returns_empty_graph() {
    let (mut app, _service, client) = start("300").await;
    app.graph().add_node(json!({"type": "SaveImage"})).unwrap();

    let created = client
        .call(RequestKind::NewWorkflow, None, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(created.kind, "comfy-pilot:workflow-created");
    assert_eq!(created.payload, json!({"success": true}));

    let reply = client
        .call(RequestKind::GetWorkflow, None, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply.payload, comfy_pilot::graph::empty_workflow());
    app.shutdown().await;
}
