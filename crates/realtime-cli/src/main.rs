//! Realtime tail
//!
//! Runs the subscriptions from a config file against the in-process
//! transport and prints every delivered change as a JSON line. Change
//! events are read from stdin, one JSON object per line; `!disconnect`,
//! `!offline`, `!online` and `!status` drive the transport.

mod config;
mod tail;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use realtime_client::{MemoryTransport, SubscriptionManager};

use crate::config::TailConfig;
use crate::tail::Command;

#[derive(Parser, Debug)]
#[command(name = "realtime-tail")]
#[command(about = "Tail realtime table subscriptions", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "realtime.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Subscribe to every change on this table in addition to the config file
    #[arg(short, long)]
    table: Option<String>,

    /// Row filter for --table, e.g. user_id=eq.42
    #[arg(short, long, requires = "table")]
    filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the events
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    info!("realtime-tail v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        TailConfig::load(&args.config)?
    } else {
        info!("Using default configuration");
        TailConfig::default()
    };
    if let Some(table) = &args.table {
        config.subscriptions.push(config::SubscriptionEntry {
            id: format!("cli-{}", table),
            table: table.clone(),
            schema: None,
            event: Default::default(),
            filter: args.filter.clone(),
            auto_reconnect: None,
            max_reconnect_attempts: None,
        });
    }
    if config.subscriptions.is_empty() {
        anyhow::bail!("nothing to tail; add [[subscriptions]] to the config or pass --table");
    }

    let transport = Arc::new(MemoryTransport::new());
    let manager = SubscriptionManager::with_config(transport.clone(), config.realtime.clone());

    for entry in &config.subscriptions {
        let id = entry.id.clone();
        let status_id = id.clone();
        let error_id = id.clone();
        let subscription = entry
            .to_config()
            .on_change(move |event| {
                println!("{}", serde_json::to_string(event)?);
                Ok(())
            })
            .on_status_change(move |status| {
                info!("{} is {}", status_id, status);
                Ok(())
            })
            .on_error(move |err| {
                warn!("{}: {}", error_id, err);
                Ok(())
            });
        manager.subscribe(id, subscription)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => match Command::parse(&line) {
                        Ok(command) => tail::apply(command, &transport, &manager),
                        Err(e) => error!("Invalid event: {}", e),
                    },
                    None => {
                        info!("End of input");
                        break;
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.unsubscribe_all().await;
    Ok(())
}
