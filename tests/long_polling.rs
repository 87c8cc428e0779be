// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for long-poll sessions, driven through the request
//! handlers the way an HTTP routing layer would.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use statehook::api::{ApiRequest, ApiResponse, ResponseBody, state};
use statehook::auth::AllowAll;
use statehook::store::{AccessOptions, MemoryStore, ObjectMeta, StateStore};
use statehook::{Gateway, GatewayConfig};

const USER: &str = "system.user.admin";
const TEST_ID: &str = "javascript.0.lp-test-bool";

fn gateway(store: Arc<MemoryStore>) -> Gateway<MemoryStore> {
    let gw = Gateway::new(store.clone(), GatewayConfig::new()).unwrap();
    let _feed = gw.spawn_change_feed(store.events());
    gw
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put_object(ObjectMeta::state(TEST_ID, "boolean"));
    store.put_state(TEST_ID, statehook::store::State::new(json!(false)));
    store
}

fn session(sid: &str) -> ApiRequest {
    ApiRequest::new("127.0.0.1")
        .with_query("method", "polling")
        .with_query("sid", sid)
}

async fn connect(gw: &Gateway<MemoryStore>, sid: &str) {
    let req = ApiRequest::new("127.0.0.1")
        .with_query("sid", sid)
        .with_query("check", "true");
    let response = state::polling_get(gw, &req).await;
    assert_eq!(response.body, ResponseBody::Text("_".to_string()));
}

async fn subscribe(gw: &Gateway<MemoryStore>, sid: &str) {
    let response = state::subscribe_state(gw, &AllowAll, &session(sid), TEST_ID).await;
    assert_eq!(response.status, 200);
}

async fn write(store: &MemoryStore, val: Value) {
    store
        .set_state(TEST_ID, val, None, &AccessOptions::for_user(USER))
        .await
        .unwrap();
}

fn poll_request(sid: &str, timeout_ms: u64) -> ApiRequest {
    ApiRequest::new("127.0.0.1")
        .with_query("sid", sid)
        .with_query("timeout", timeout_ms.to_string())
}

fn event_json(response: &ApiResponse) -> Value {
    match &response.body {
        ResponseBody::Text(payload) => serde_json::from_str(payload).unwrap(),
        other => panic!("expected event payload, got {other:?}"),
    }
}

// ============================================================================
// Isolation between sessions
// ============================================================================

#[tokio::test]
async fn unsubscribing_one_session_does_not_silence_the_other() {
    let store = seeded_store();
    let gw = gateway(store.clone());

    // A and B connect and subscribe to the same id.
    connect(&gw, "A").await;
    connect(&gw, "B").await;
    subscribe(&gw, "A").await;
    subscribe(&gw, "B").await;
    assert_eq!(store.state_subscription_count(TEST_ID), 1);

    // A leaves.
    let response = state::unsubscribe_state(&gw, &AllowAll, &session("A"), TEST_ID).await;
    assert_eq!(response.status, 200);

    // The store subscription survives for B.
    assert_eq!(store.state_subscription_count(TEST_ID), 1);

    // B's next poll sees the change.
    let gw2 = gw.clone();
    let poller =
        tokio::spawn(async move { state::polling_get(&gw2, &poll_request("B", 5_000)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    write(&store, json!(true)).await;

    let response = poller.await.unwrap();
    let event = event_json(&response);
    assert_eq!(event["id"], TEST_ID);
    assert_eq!(event["state"]["val"], true);

    // A's session is gone entirely.
    assert!(
        state::get_states_subscribes(&gw, &AllowAll, &session("A"))
            .await
            .status
            == 404
    );
}

#[tokio::test]
async fn sessions_from_one_address_are_isolated_by_sid() {
    let store = seeded_store();
    let gw = gateway(store.clone());

    connect(&gw, "A").await;
    connect(&gw, "B").await;
    subscribe(&gw, "A").await;

    write(&store, json!(true)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only A has a backlog entry; B times out empty.
    let response = state::polling_get(&gw, &poll_request("A", 100)).await;
    assert!(matches!(response.body, ResponseBody::Text(_)));

    let response = state::polling_get(&gw, &poll_request("B", 100)).await;
    assert_eq!(response.body, ResponseBody::Empty);
}

// ============================================================================
// Waiter discipline
// ============================================================================

#[tokio::test]
async fn concurrent_poll_on_one_session_is_a_conflict() {
    let store = seeded_store();
    let gw = gateway(store.clone());
    connect(&gw, "A").await;

    let gw2 = gw.clone();
    let first =
        tokio::spawn(async move { state::polling_get(&gw2, &poll_request("A", 2_000)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = state::polling_get(&gw, &poll_request("A", 2_000)).await;
    assert_eq!(second.status, 409);

    // The parked poll still completes normally.
    let response = first.await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn unregistering_releases_a_parked_poll_with_empty_data() {
    let store = seeded_store();
    let gw = gateway(store.clone());
    connect(&gw, "A").await;
    subscribe(&gw, "A").await;

    let gw2 = gw.clone();
    let poller =
        tokio::spawn(async move { state::polling_get(&gw2, &poll_request("A", 30_000)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    state::unsubscribe_state(&gw, &AllowAll, &session("A"), TEST_ID).await;

    let response = poller.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, ResponseBody::Empty);

    // No empty-watch record lingers.
    assert!(gw.registry().is_empty());
}

// ============================================================================
// Backlog freshness
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stale_backlog_entries_are_dropped() {
    let store = seeded_store();
    let gw = gateway(store.clone());
    connect(&gw, "A").await;
    subscribe(&gw, "A").await;

    write(&store, json!(true)).await;
    // Let the change feed task fan out.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    tokio::time::advance(Duration::from_millis(3_500)).await;
    write(&store, json!(false)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The first event aged out; only the fresh one is served.
    let response = state::polling_get(&gw, &poll_request("A", 100)).await;
    let event = event_json(&response);
    assert_eq!(event["state"]["val"], false);

    let response = state::polling_get(&gw, &poll_request("A", 100)).await;
    assert_eq!(response.body, ResponseBody::Empty);
}

// ============================================================================
// Session garbage collection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sessions_that_never_reconnect_are_reclaimed() {
    let store = seeded_store();
    let gw = gateway(store.clone());

    // Short lease, never comes back.
    let req = ApiRequest::new("127.0.0.1")
        .with_query("sid", "A")
        .with_query("timeout", "1000")
        .with_query("check", "true");
    state::polling_get(&gw, &req).await;
    subscribe(&gw, "A").await;
    assert_eq!(gw.registry().polling_count(), 1);

    // Let the spawned GC task register its interval timer before the
    // paused clock moves, so the advance actually fires its tick.
    tokio::task::yield_now().await;
    // One GC sweep interval later the session and its store subscription
    // are gone.
    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(gw.registry().polling_count(), 0);
    assert_eq!(store.state_subscription_count(TEST_ID), 0);
}

// ============================================================================
// Write then wait
// ============================================================================

#[tokio::test(start_paused = true)]
async fn write_with_timeout_answers_501_without_acknowledgement() {
    let store = seeded_store();
    let gw = gateway(store.clone());

    let req = ApiRequest::new("127.0.0.1")
        .with_query("value", "true")
        .with_query("timeout", "500");
    let response = state::read_state(&gw, &AllowAll, &req, TEST_ID).await;

    assert_eq!(response.status, 501);
    match response.body {
        ResponseBody::Json(body) => {
            assert_eq!(body["error"], "timeout");
            assert_eq!(body["id"], TEST_ID);
            assert_eq!(body["val"], true);
        }
        other => panic!("expected JSON body, got {other:?}"),
    }
}

#[tokio::test]
async fn write_with_timeout_returns_the_acknowledged_state() {
    let store = seeded_store();
    let gw = gateway(store.clone());

    let gw2 = gw.clone();
    let writer = tokio::spawn(async move {
        let req = ApiRequest::new("127.0.0.1")
            .with_query("value", "true")
            .with_query("timeout", "5000");
        state::read_state(&gw2, &AllowAll, &req, TEST_ID).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The device acknowledges.
    store
        .set_state(TEST_ID, json!(true), Some(true), &AccessOptions::for_user(USER))
        .await
        .unwrap();

    let response = writer.await.unwrap();
    assert_eq!(response.status, 200);
    match response.body {
        ResponseBody::Json(body) => {
            assert_eq!(body["val"], true);
            assert_eq!(body["ack"], true);
        }
        other => panic!("expected JSON body, got {other:?}"),
    }
}
