// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Conduit Node
//!
//! Entry point for the `conduit-node` binary. Parses CLI arguments,
//! initializes logging and metrics, joins the job-event overlay and logs
//! every event it receives until interrupted.
//!
//! The binary supports three subcommands:
//!
//! - `run`    : join the cluster and relay job events
//! - `init`   : create the node key for a port and print its address
//! - `version`: print build version information

mod cli;
mod logging;
mod metrics;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use conduit_protocol::config::{self, default_key_dir, key_ref_for_port};
use conduit_protocol::{
    JobEvent, KeyStore, Libp2pTransport, Transport, TransportMetrics, TransportObserver,
};

use cli::{Commands, ConduitNodeCli};
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ConduitNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs a node: transport, logging subscriber and metrics endpoint.
///
/// Shutdown happens in a fixed order. The transport stops first, so no new
/// events are dispatched and in-flight handlers finish; only then does the
/// metrics server go away.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let transport_config = args.transport_config();
    tracing::info!(
        port = transport_config.port,
        metrics_port = args.metrics_port,
        peers = transport_config.peers.len(),
        key_dir = %transport_config.key_dir.display(),
        "starting conduit-node"
    );

    let metrics = Arc::new(TransportMetrics::new().context("failed to create metrics registry")?);
    let observer: Arc<dyn TransportObserver> = metrics.clone();

    let transport = Libp2pTransport::from_config(transport_config, observer)
        .await
        .context("failed to configure transport")?;
    transport.subscribe(Arc::new(log_job_event));

    // --- Metrics server ---
    let stop_metrics = CancellationToken::new();
    let metrics_addr = SocketAddr::new(args.listen_host, args.metrics_port);
    let mut metrics_server = tokio::spawn(metrics::serve(
        metrics_addr,
        metrics.clone(),
        stop_metrics.clone(),
    ));

    // --- Transport ---
    if let Err(e) = transport.start().await {
        stop_metrics.cancel();
        if let Err(shutdown_err) = transport.shutdown().await {
            tracing::warn!(error = %shutdown_err, "transport shutdown after failed start");
        }
        return Err(e).context("failed to start transport");
    }
    tracing::info!(
        host_id = %transport.host_id(),
        addrs = ?transport.listen_addrs().await.unwrap_or_default(),
        "node running"
    );

    // --- Serve ---
    let mut metrics_done = false;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping transport");
        }
        res = &mut metrics_server => {
            metrics_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("metrics server exited"),
                Ok(Err(e)) => tracing::error!("metrics server error: {:#}", e),
                Err(e) => tracing::error!("metrics server task failed: {}", e),
            }
        }
    }

    transport
        .shutdown()
        .await
        .context("transport shutdown failed")?;

    stop_metrics.cancel();
    if !metrics_done {
        match metrics_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("metrics server error: {:#}", e),
            Err(e) => tracing::error!("metrics server task failed: {}", e),
        }
    }

    tracing::info!("conduit-node stopped");
    Ok(())
}

/// The subscriber every node runs: one log line per received event.
async fn log_job_event(cx: Context, event: JobEvent) {
    let span = cx.span();
    let trace_id = span.span_context().trace_id();
    tracing::info!(
        job_id = %event.job_id,
        event = %event.event_name,
        shard = event.shard_index,
        source = %event.short_source(),
        status = %event.status,
        %trace_id,
        "job event"
    );
}

/// Creates (or loads) the identity for a port and prints the address other
/// nodes pass to `--peers`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("conduit_node=info", LogFormat::Pretty);

    let key_dir = args.key_dir.unwrap_or_else(default_key_dir);
    let store = KeyStore::new(&key_dir);
    let key_ref = key_ref_for_port(args.port);
    let identity = store
        .load_or_create(&key_ref)
        .with_context(|| format!("failed to load or create key {key_ref}"))?;

    tracing::info!(
        key_path = %store.path_for(&key_ref).display(),
        peer_id = %identity.peer_id(),
        "node identity ready"
    );

    println!("{}", peer_address(args.host, args.port, &identity.peer_id().to_string()));
    Ok(())
}

/// `/ip4/<host>/tcp/<port>/p2p/<id>`, or `/ip6/...` for IPv6 hosts.
fn peer_address(host: IpAddr, port: u16, peer_id: &str) -> String {
    let family = match host {
        IpAddr::V4(_) => "ip4",
        IpAddr::V6(_) => "ip6",
    };
    format!("/{family}/{host}/tcp/{port}/p2p/{peer_id}")
}

/// Prints version information to stdout.
fn print_version() {
    println!("conduit-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", config::PROTOCOL_VERSION);
    println!("topic        {}", config::JOB_EVENT_TOPIC);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
