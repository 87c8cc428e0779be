// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for webhook delivery using wiremock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use statehook::store::{AccessOptions, MemoryStore, StateStore};
use statehook::{Error, Gateway, GatewayConfig, Transport, WatchKind};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER: &str = "system.user.admin";

fn gateway(store: Arc<MemoryStore>) -> Gateway<MemoryStore> {
    let gw = Gateway::new(
        store.clone(),
        GatewayConfig::new().with_hook_timeout(Duration::from_millis(500)),
    )
    .unwrap();
    let _feed = gw.spawn_change_feed(store.events());
    gw
}

async fn set_state(store: &MemoryStore, id: &str, val: Value) {
    store
        .set_state(id, val, None, &AccessOptions::for_user(USER))
        .await
        .unwrap();
}

/// Polls until the mock server has seen at least `count` requests.
async fn wait_for_requests(server: &MockServer, count: usize) {
    for _ in 0..100 {
        if server.received_requests().await.unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not receive {count} requests in time");
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn registration_probes_the_hook_with_a_test_payload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, json!({ "test": true }));

    assert_eq!(gw.registry().len(), 1);
    assert_eq!(store.state_subscription_count("demo.0.light"), 1);
}

#[tokio::test]
async fn unreachable_hook_leaves_no_trace() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());

    // Nothing listens here.
    let err = gw
        .register_subscribe(
            "http://127.0.0.1:59999/hook/",
            Transport::Webhook,
            WatchKind::State,
            "demo.0.light",
            USER,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(err.status_code(), 422);
    assert!(gw.registry().is_empty());
    assert_eq!(store.state_subscription_count("demo.0.light"), 0);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn state_changes_are_posted_to_the_hook() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    set_state(&store, "demo.0.light", json!(true)).await;

    // Probe plus one delivery.
    wait_for_requests(&mock_server, 2).await;

    let requests = mock_server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body["id"], "demo.0.light");
    assert_eq!(body["state"]["val"], true);
    assert_eq!(body["state"]["ack"], false);
}

#[tokio::test]
async fn changes_for_other_ids_are_not_delivered() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    // Watched by nobody; the store does not even emit it.
    set_state(&store, "demo.0.other", json!(1)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "only the registration probe expected");
}

// ============================================================================
// Failure eviction
// ============================================================================

#[tokio::test]
async fn three_consecutive_failures_evict_the_hook() {
    let mock_server = MockServer::start().await;
    // The probe succeeds, every delivery fails.
    Mock::given(method("POST"))
        .and(body_string_contains("test"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    for _ in 0..3 {
        set_state(&store, "demo.0.light", json!(false)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for _ in 0..100 {
        if gw.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gw.registry().is_empty(), "hook not evicted");
    assert_eq!(store.state_subscription_count("demo.0.light"), 0);

    // A further change produces no new request.
    let before = mock_server.received_requests().await.unwrap().len();
    set_state(&store, "demo.0.light", json!(true)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = mock_server.received_requests().await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn a_successful_delivery_resets_the_failure_counter() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("test"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    // Two failures, then success again.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    for i in 0..5 {
        set_state(&store, "demo.0.light", json!(i)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Two failures, then successes: the counter reset keeps the record alive.
    assert_eq!(gw.registry().len(), 1);
}

// ============================================================================
// Unload
// ============================================================================

#[tokio::test]
async fn unload_notifies_hooks_with_a_disconnect_payload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let hook = format!("{}/hook/", mock_server.uri());

    gw.register_subscribe(&hook, Transport::Webhook, WatchKind::State, "demo.0.light", USER)
        .await
        .unwrap();

    gw.unload().await;
    assert!(gw.registry().is_empty());

    let requests = mock_server.received_requests().await.unwrap();
    let last: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
    assert_eq!(last, json!({ "disconnect": true }));
}
