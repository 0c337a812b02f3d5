use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use events_bus::{handler_fn, BusClient, BusConfig, Envelope, EventKind, RoutingTable};
use serde::Serialize;
use serde_json::Value;
use telemetry::{HealthProbe, LivenessReport};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::{Cli, Command};
use crate::server;

pub async fn run(cli: Cli) -> Result<()> {
    let config = bus_config(&cli)?;

    match cli.command {
        Command::Publish { kind, payload } => publish(config, kind, payload).await,
        Command::Listen { kind, count } => listen(config, kind, count).await,
        Command::Topology { json } => topology(&config.routing_table(), json),
        Command::Health => health(config).await,
        Command::ServeHealth { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("invalid bind address {host}:{port}"))?;
            serve_health(config, addr).await
        }
    }
}

fn bus_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = BusConfig::from_env().context("invalid RABBITMQ_* configuration")?;
    if let Some(url) = &cli.url {
        config = config.with_url(url.clone());
    }
    Ok(config.with_service_name(cli.service_name.clone()))
}

async fn connect(config: BusConfig) -> Result<BusClient> {
    let url = config.url.clone();
    let routes = config.routing_table();
    BusClient::connect(config, routes)
        .await
        .with_context(|| format!("failed to connect to {url}"))
}

async fn publish(config: BusConfig, kind: EventKind, payload: Value) -> Result<()> {
    let bus = connect(config).await?;
    let envelope = bus.publish(kind, payload).await;
    bus.close().await?;

    let envelope = envelope.with_context(|| format!("failed to publish {kind}"))?;
    info!(kind = %kind, delivery_id = %envelope.delivery_id(), "Published");
    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

async fn listen(config: BusConfig, kind: EventKind, count: Option<usize>) -> Result<()> {
    let bus = connect(config).await?;
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);

    bus.subscribe(
        kind,
        handler_fn(move |envelope| {
            let tx = tx.clone();
            async move {
                tx.send(envelope)
                    .await
                    .map_err(|_| events_bus::HandlerError::failed("listener stopped"))
            }
        }),
    )
    .await?;
    info!(kind = %kind, "Listening; press Ctrl-C to stop");

    let mut received = 0usize;
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                println!("{}", serde_json::to_string(&envelope)?);
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bus.close().await?;
    info!(received, "Listener stopped");
    Ok(())
}

#[derive(Serialize)]
struct TopologyRow<'a> {
    kind: EventKind,
    exchange: &'a str,
    exchange_kind: String,
    queue: &'a str,
    routing_key: &'a str,
}

fn topology(routes: &RoutingTable, json: bool) -> Result<()> {
    let rows: Vec<TopologyRow<'_>> = routes
        .iter()
        .map(|(kind, route)| TopologyRow {
            kind,
            exchange: &route.exchange.name,
            exchange_kind: route.exchange.kind.to_string(),
            queue: &route.queue,
            routing_key: &route.routing_key,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<18} {:<24} {:<8} {:<18} ROUTING KEY", "KIND", "EXCHANGE", "TYPE", "QUEUE");
    for row in rows {
        println!(
            "{:<18} {:<24} {:<8} {:<18} {}",
            row.kind.as_str(),
            row.exchange,
            row.exchange_kind,
            row.queue,
            row.routing_key
        );
    }
    Ok(())
}

async fn health(config: BusConfig) -> Result<()> {
    let report = match connect(config).await {
        Ok(bus) => {
            let probes: Vec<Arc<dyn HealthProbe>> = vec![Arc::new(bus.clone())];
            let report = LivenessReport::evaluate(&probes).await;
            bus.close().await?;
            report
        }
        Err(err) => {
            warn!(error = %err, "Broker unreachable");
            server::unreachable_report(&format!("{err:#}"))
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.status.is_ok() {
        bail!("event bus is not healthy");
    }
    Ok(())
}

async fn serve_health(config: BusConfig, addr: SocketAddr) -> Result<()> {
    let bus = connect(config).await?;
    let probes: Vec<Arc<dyn HealthProbe>> = vec![Arc::new(bus.clone())];

    let served = server::serve(addr, probes).await;
    bus.close().await?;
    served
}
