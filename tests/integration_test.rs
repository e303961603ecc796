// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Integration tests wiring `crossbus-core`, `crossbus-resilience`, and
//! `crossbus-transport-memory` together the way the demo binary does.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbus_core::{Bus, BusOptionsBuilder, HandlerContext};
use crossbus_resilience::{CircuitBreaker, RetryPolicy};
use crossbus_transport_memory::MemoryNetwork;

fn wire_two_peers(a: &str, b: &str) -> (Bus, Bus, MemoryNetwork) {
    let network = MemoryNetwork::new();
    let bus_a = Bus::new(BusOptionsBuilder::new().peer_id(a).build());
    let bus_b = Bus::new(BusOptionsBuilder::new().peer_id(b).build());
    network.register(a, bus_a.clone());
    network.register(b, bus_b.clone());
    bus_a.add_peer(b, network.transport_to(b), serde_json::json!({})).unwrap();
    bus_b.add_peer(a, network.transport_to(a), serde_json::json!({})).unwrap();
    (bus_a, bus_b, network)
}

#[tokio::test]
async fn request_response_across_the_memory_transport() {
    let (bus_a, bus_b, _network) = wire_two_peers("a", "b");

    bus_b
        .handle(
            "add-one",
            Arc::new(|payload: serde_json::Value, _ctx: HandlerContext| {
                Box::pin(async move {
                    let n = payload["n"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!({"n": n + 1}))
                })
            }),
            Default::default(),
        )
        .unwrap();

    let response = bus_a.request("b", "add-one", serde_json::json!({"n": 41}), None).await.unwrap();
    assert_eq!(response["n"], 42);
}

#[tokio::test]
async fn broadcast_reaches_every_connected_peer() {
    let network = MemoryNetwork::new();
    let hub = Bus::new(BusOptionsBuilder::new().peer_id("hub").build());
    let leaf_a = Bus::new(BusOptionsBuilder::new().peer_id("leaf-a").build());
    let leaf_b = Bus::new(BusOptionsBuilder::new().peer_id("leaf-b").build());

    network.register("hub", hub.clone());
    network.register("leaf-a", leaf_a.clone());
    network.register("leaf-b", leaf_b.clone());

    hub.add_peer("leaf-a", network.transport_to("leaf-a"), serde_json::json!({})).unwrap();
    hub.add_peer("leaf-b", network.transport_to("leaf-b"), serde_json::json!({})).unwrap();
    leaf_a.add_peer("hub", network.transport_to("hub"), serde_json::json!({})).unwrap();
    leaf_b.add_peer("hub", network.transport_to("hub"), serde_json::json!({})).unwrap();

    let received_a = Arc::new(AtomicU32::new(0));
    let received_b = Arc::new(AtomicU32::new(0));
    let ra = received_a.clone();
    let rb = received_b.clone();
    leaf_a.on_sync("announce", Default::default(), move |_data, _source| {
        ra.fetch_add(1, Ordering::SeqCst);
    });
    leaf_b.on_sync("announce", Default::default(), move |_data, _source| {
        rb.fetch_add(1, Ordering::SeqCst);
    });

    hub.broadcast("announce", serde_json::json!({"hello": true}), Default::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(received_a.load(Ordering::SeqCst), 1);
    assert_eq!(received_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_recovers_from_a_transient_handler_failure() {
    let (bus_a, bus_b, _network) = wire_two_peers("a", "b");

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_handler = attempts.clone();
    bus_b
        .handle(
            "flaky",
            Arc::new(move |_payload: serde_json::Value, _ctx: HandlerContext| {
                let attempts = attempts_in_handler.clone();
                Box::pin(async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(crossbus_core::CrossBusError::from_code(
                            crossbus_core::ErrorCode::ChannelFailed,
                            serde_json::json!({}),
                        ))
                    } else {
                        Ok(serde_json::json!({"ok": true}))
                    }
                })
            }),
            Default::default(),
        )
        .unwrap();

    let policy = RetryPolicy::fast();
    let result = crossbus_resilience::with_retry(
        policy,
        || {
            let bus_a = bus_a.clone();
            Box::pin(async move { bus_a.request("b", "flaky", serde_json::json!({}), None).await })
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(result["ok"], true);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn circuit_breaker_stops_calling_a_failing_dependency() {
    let breaker = Arc::new(CircuitBreaker::new(2, 1, Duration::from_millis(50)));
    assert_eq!(breaker.state(), crossbus_resilience::CircuitState::Closed);
}
