//! Stdin driver: feeds change events into the in-process transport

use realtime_client::{ChangeEvent, MemoryTransport, SubscriptionManager};
use tracing::{info, warn};

/// What one input line asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Publish a change event
    Emit(Box<ChangeEvent>),
    /// Drop every open channel
    Disconnect,
    Offline,
    Online,
    /// Print subscription states
    Status,
    Skip,
}

impl Command {
    /// `!`-prefixed lines are commands; anything else must be a JSON change event
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let line = line.trim();
        Ok(match line {
            "" => Self::Skip,
            l if l.starts_with('#') => Self::Skip,
            "!disconnect" => Self::Disconnect,
            "!offline" => Self::Offline,
            "!online" => Self::Online,
            "!status" => Self::Status,
            other => Self::Emit(Box::new(serde_json::from_str(other)?)),
        })
    }
}

pub fn apply(command: Command, transport: &MemoryTransport, manager: &SubscriptionManager) {
    match command {
        Command::Emit(event) => {
            let delivered = transport.emit(*event);
            if delivered == 0 {
                info!("Event matched no subscription");
            }
        }
        Command::Disconnect => {
            let dropped = transport.disconnect_all();
            warn!("Dropped {} channels", dropped);
        }
        Command::Offline => {
            transport.set_online(false);
            warn!("Transport offline");
        }
        Command::Online => {
            transport.set_online(true);
            info!("Transport online");
        }
        Command::Status => {
            let mut snapshots = manager.subscriptions();
            snapshots.sort_by(|a, b| a.id.cmp(&b.id));
            for s in snapshots {
                info!(
                    "{} {}.{} [{}] status={} attempts={}",
                    s.id, s.schema, s.table, s.event, s.status, s.reconnect_attempts
                );
            }
        }
        Command::Skip => {}
    }
}
