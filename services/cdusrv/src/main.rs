//! cdusrv entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cdusrv::store::LinkStatus;
use cdusrv::{build_transport, engine, CduConfig, CduHandle, RegisterMap};

#[derive(Parser, Debug)]
#[command(author, version, about = "cdusrv - CDU Modbus polling and control service")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "CDUSRV_CONFIG",
        default_value = "config/cdusrv.yaml"
    )]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Load the configuration and register map, print a summary and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CduConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
        config.validate()?;
    }

    let _log_guard = common::init_logging(&config.log_config()).context("Failed to init logging")?;

    let map = match config.load_register_map() {
        Ok(map) => Arc::new(map),
        Err(e) => {
            error!(
                "Failed to load register map {}: {e}",
                config.registers.source.display()
            );
            return Err(e.into());
        },
    };

    if args.validate {
        print_summary(&config, &map)?;
        return Ok(());
    }

    info!(
        "Starting {} v{}: {} registers from {}",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        map.len(),
        config.registers.source.display()
    );

    let transport = build_transport(&config.link);
    let shutdown = CancellationToken::new();
    let (handle, poll_task) = engine::spawn(
        map,
        transport,
        config.engine_config(),
        shutdown.clone(),
    );
    let watcher = tokio::spawn(watch_status(handle));

    let signal = common::wait_for_shutdown().await;
    info!("Received {signal}, stopping");
    shutdown.cancel();

    poll_task.await.context("Poll task panicked")?;
    watcher.abort();
    info!("{} stopped", config.service.name);
    Ok(())
}

/// Log every publication at debug, link status changes at info
async fn watch_status(handle: CduHandle) {
    let mut last = handle.get_status().health.status();
    let mut updates = Box::pin(handle.stream_status());
    while let Some(status) = updates.next().await {
        debug!(
            "Status cycle {}: {} fields, {} consecutive failures",
            status.snapshot.cycle,
            status.snapshot.fields.len(),
            status.health.consecutive_failures
        );
        let current = status.health.status();
        if current != last {
            match (current, &status.health.last_error) {
                (LinkStatus::Online, _) | (_, None) => info!("Link {last:?} -> {current:?}"),
                (_, Some(err)) => info!("Link {last:?} -> {current:?}: {err}"),
            }
            last = current;
        }
    }
}

fn print_summary(config: &CduConfig, map: &RegisterMap) -> Result<()> {
    let ranges = map.read_ranges();
    let writable = map.all_registers().iter().filter(|r| r.is_writable()).count();
    let summary = serde_json::json!({
        "service": config.service.name,
        "primary": config.link.primary.to_string(),
        "fallback": config.link.fallback.as_ref().map(ToString::to_string),
        "registers": map.len(),
        "writable": writable,
        "read_ranges": ranges.len(),
        "interval_ms": config.polling.interval_ms,
        "byte_order": config.registers.byte_order,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
