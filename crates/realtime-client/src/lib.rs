//! Realtime Subscription Client
//!
//! Keeps named table-change subscriptions alive against a pub/sub backend:
//! - One transport channel per subscription, recreated on every reconnect
//! - Jittered exponential backoff with a retry limit
//! - Per-kind event hooks isolated from each other and from the manager
//! - An in-process transport for local use and tests

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod backoff;
pub mod builders;
pub mod channel;
pub mod manager;
pub mod memory;
mod routing;
pub mod subscription;

pub use backoff::BackoffPolicy;
pub use channel::{
    ChangeFilter, ChannelHandle, ChannelStatus, EventCallback, StatusCallback, Transport,
};
pub use manager::{SubscriptionHandle, SubscriptionManager};
pub use memory::{MemoryChannel, MemoryTransport};
pub use subscription::{
    HandlerError, HandlerResult, Hooks, ResolvedConfig, SubscriptionConfig, SubscriptionSnapshot,
    SubscriptionStatus,
};

pub use realtime_common::{
    ChangeEvent, Error, EventFilter, EventKind, FilterOp, RealtimeConfig, ReconnectConfig, Result,
    RowFilter,
};
