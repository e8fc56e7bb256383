// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cgr_config::GatewayConfig;
use cgr_core::{
    CapabilityDescriptor, DescriptorMetadata, Economics, ExecutionMode, ExecutionSpec,
    LatencyHint, PaymentSignal, Performance,
};
use cgr_daemon::{build_app, register_descriptors, AppState};
use cgr_executor::{MockConfidentialExecutor, MockPublicExecutor};
use cgr_router::Services;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cgr-daemon", version, about = "Capability routing gateway daemon")]
struct Args {
    /// Override the bind port from `ROUTER_PORT`/config.
    #[arg(long)]
    port: Option<u16>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

fn seed_descriptors() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor {
            id: "cap.price.lookup.v1".into(),
            name: "Price Lookup".into(),
            description: "Look up the current price of a token pair".into(),
            version: "1.0.0".into(),
            inputs_schema: serde_json::json!({
                "type": "object",
                "required": ["base_token", "quote_token"],
                "properties": {
                    "base_token": {"type": "string"},
                    "quote_token": {"type": "string"}
                }
            }),
            outputs_schema: serde_json::json!({
                "type": "object",
                "properties": {"price": {"type": "number"}}
            }),
            execution: ExecutionSpec {
                mode: ExecutionMode::Public,
                executor_hint: None,
                proof_type: None,
            },
            economics: Economics {
                cost_hint: 0.0001,
                currency: "USD".into(),
                payment_signal: PaymentSignal::default(),
            },
            performance: Performance {
                latency_hint: LatencyHint::Low,
                reliability_hint: 0.995,
                throughput_limit: Some(500),
            },
            composable: true,
            metadata: DescriptorMetadata {
                tags: vec!["price".into(), "market-data".into()],
                provider_hints: vec!["public-executor".into()],
            },
            deprecated: false,
        },
        CapabilityDescriptor {
            id: "cap.cspl.wrap.v1".into(),
            name: "Confidential SPL Wrap".into(),
            description: "Wrap a token transfer under a confidential executor".into(),
            version: "1.0.0".into(),
            inputs_schema: serde_json::json!({
                "type": "object",
                "required": ["amount"],
                "properties": {"amount": {"type": "number"}}
            }),
            outputs_schema: serde_json::json!({
                "type": "object",
                "properties": {"wrapped": {"type": "boolean"}}
            }),
            execution: ExecutionSpec {
                mode: ExecutionMode::Confidential,
                executor_hint: None,
                proof_type: Some("tee-attestation".into()),
            },
            economics: Economics {
                cost_hint: 0.01,
                currency: "USD".into(),
                payment_signal: PaymentSignal::default(),
            },
            performance: Performance {
                latency_hint: LatencyHint::Medium,
                reliability_hint: 0.98,
                throughput_limit: Some(50),
            },
            composable: false,
            metadata: DescriptorMetadata {
                tags: vec!["confidential".into(), "payments".into()],
                provider_hints: vec!["confidential-executor".into()],
            },
            deprecated: false,
        },
    ]
}

/// Periodically samples heap/latency pressure and feeds it into the
/// adaptive load factor and health snapshot (spec §5's memory supervisor).
/// `cgr-router` computes the sample; this task only owns the timer, since
/// `Services` deliberately doesn't spawn anything itself.
fn spawn_pressure_supervisor(services: Arc<Services>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let (heap_pct, avg_latency_ms) = services.sample_pressure();
            services.update_load(heap_pct, avg_latency_ms);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (mut config, warnings) =
        GatewayConfig::from_env().context("failed to load gateway configuration")?;
    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }
    if let Some(port) = args.port {
        config.router_port = port;
    }

    let mut services = Services::new(config.clone());
    register_descriptors(&mut services, seed_descriptors())
        .context("failed to register seed capability descriptors")?;
    services.register_executor(Arc::new(MockPublicExecutor::new("public-executor")));
    services.register_executor(Arc::new(MockConfidentialExecutor::new(
        "confidential-executor",
        vec!["cap.cspl.wrap.v1".to_string()],
    )));

    let services = Arc::new(services);
    spawn_pressure_supervisor(services.clone());

    let state = Arc::new(AppState { services });
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.router_port)
        .parse()
        .context("invalid host/port combination")?;
    info!(%addr, "capability routing gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server terminated unexpectedly")?;
    Ok(())
}
