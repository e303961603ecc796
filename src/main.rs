// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! `crossbus-demo` — wires two in-process buses together over the
//! in-memory transport and drives a request/response exchange, so the
//! whole stack (routing, handler invocation, hooks) can be exercised
//! end to end without any real network.
//!
//! ```sh
//! crossbus-demo --peer-a alice --peer-b bob --message "ping"
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crossbus_core::{Bus, BusOptionsBuilder, HandlerContext};
use crossbus_transport_memory::MemoryNetwork;

#[derive(Parser, Debug)]
#[command(name = "crossbus-demo", about = "Two-peer request/response demo over an in-memory transport")]
struct Args {
    /// Peer id of the initiating bus.
    #[arg(long, default_value = "alice")]
    peer_a: String,

    /// Peer id of the responding bus.
    #[arg(long, default_value = "bob")]
    peer_b: String,

    /// Payload sent as the request's `data` field.
    #[arg(long, default_value = "ping")]
    message: String,

    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let network = MemoryNetwork::new();

    let bus_a = Bus::new(BusOptionsBuilder::new().peer_id(args.peer_a.clone()).build());
    let bus_b = Bus::new(BusOptionsBuilder::new().peer_id(args.peer_b.clone()).build());

    network.register(args.peer_a.clone(), bus_a.clone());
    network.register(args.peer_b.clone(), bus_b.clone());

    bus_a.add_peer(args.peer_b.clone(), network.transport_to(args.peer_b.clone()), serde_json::json!({}))?;
    bus_b.add_peer(args.peer_a.clone(), network.transport_to(args.peer_a.clone()), serde_json::json!({}))?;

    bus_b.handle(
        "echo",
        Arc::new(|payload: serde_json::Value, ctx: HandlerContext| {
            Box::pin(async move {
                println!("{} handling '{}' from {}", ctx.local_peer_id, ctx.name, ctx.source);
                Ok(serde_json::json!({"echo": payload}))
            })
        }),
        Default::default(),
    )?;

    let response = bus_a
        .request(
            &args.peer_b,
            "echo",
            serde_json::json!({"message": args.message}),
            Some(Duration::from_millis(args.timeout_ms)),
        )
        .await?;

    println!("{} received: {}", args.peer_a, response);

    bus_a.destroy().await;
    bus_b.destroy().await;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}
