//! Channel adapter interface
//!
//! The transport that owns sockets and delivers change events is an external
//! collaborator. The manager only needs to open a uniquely named channel,
//! register one change listener on it, subscribe, and close it again. Every
//! connection attempt uses a fresh channel; a channel is never reused.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use realtime_common::{ChangeEvent, EventFilter, Result, RowFilter};

/// Connection status reported by a channel after `subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The subscribe handshake completed; events will flow
    Opened,
    /// The transport closed the channel
    Closed,
    /// The transport failed to open or lost the channel
    Error(String),
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "OPENED"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Error(reason) => write!(f, "ERROR({})", reason),
        }
    }
}

/// What a channel listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub row: Option<RowFilter>,
}

impl ChangeFilter {
    /// Whether an event passes this filter
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.schema == "*" || self.schema == event.schema)
            && (self.table == "*" || self.table == event.table)
            && self.event.matches(event.kind)
            && self
                .row
                .as_ref()
                .map_or(true, |row| event.record().map_or(false, |r| row.matches(r)))
    }
}

/// Callback invoked for every change event a channel delivers
pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback invoked on every status transition of a channel
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// One transport channel instance
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Unique channel name
    fn name(&self) -> &str;

    /// Register the change listener. Called before `subscribe`.
    fn on_event(&self, filter: ChangeFilter, callback: EventCallback);

    /// Start the subscribe handshake. The outcome arrives through `status`,
    /// which may be called again later (e.g. `Closed` after `Opened`).
    async fn subscribe(&self, status: StatusCallback) -> Result<()>;
}

/// Factory and owner of channels
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel with a unique name
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn ChannelHandle>>;

    /// Close a channel. Best-effort; callers log and ignore failures.
    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<()>;
}
