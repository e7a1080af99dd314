//! Realtime Common Types and Utilities
//!
//! Shared change-event types, configuration, and error handling for the
//! realtime subscription client.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{RealtimeConfig, ReconnectConfig};
pub use error::{Error, Result};
pub use types::{ChangeEvent, EventFilter, EventKind, FilterOp, RowFilter};
