//! Subscription configuration, status model, and per-subscription records

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use realtime_common::{ChangeEvent, Error, EventFilter, RealtimeConfig, Result, RowFilter};

use crate::channel::{ChangeFilter, ChannelHandle};
use crate::routing::{Dispatcher, RETIRED};

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a subscription
///
/// `IDLE -> SUBSCRIBING -> SUBSCRIBED -> (ERROR | UNSUBSCRIBING)`,
/// `ERROR -> SUBSCRIBING` on a scheduled retry, `UNSUBSCRIBING -> IDLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    #[default]
    Idle,
    Subscribing,
    Subscribed,
    Error,
    Unsubscribing,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Subscribing => "SUBSCRIBING",
            Self::Subscribed => "SUBSCRIBED",
            Self::Error => "ERROR",
            Self::Unsubscribing => "UNSUBSCRIBING",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Error returned by a caller-supplied hook
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every hook
pub type HandlerResult = std::result::Result<(), HandlerError>;

pub type EventHook = Arc<dyn Fn(&ChangeEvent) -> HandlerResult + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&Error) -> HandlerResult + Send + Sync>;
pub type StatusHook = Arc<dyn Fn(SubscriptionStatus) -> HandlerResult + Send + Sync>;

/// Callbacks attached to one subscription
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_insert: Option<EventHook>,
    pub on_update: Option<EventHook>,
    pub on_delete: Option<EventHook>,
    pub on_change: Option<EventHook>,
    pub on_error: Option<ErrorHook>,
    pub on_status_change: Option<StatusHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_change", &self.on_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_status_change", &self.on_status_change.is_some())
            .finish()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Caller-supplied subscription configuration
///
/// Unset options fall back to the manager's [`RealtimeConfig`] when the
/// subscription is created.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionConfig {
    pub schema: Option<String>,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<String>,
    pub hooks: Hooks,
    pub auto_reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub base_reconnect_delay: Option<Duration>,
}

impl SubscriptionConfig {
    /// Listen to `event` changes on `table`
    pub fn new(table: impl Into<String>, event: EventFilter) -> Self {
        Self {
            table: table.into(),
            event,
            ..Self::default()
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Row filter expression, e.g. `user_id=eq.42`
    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    pub fn row_filter(mut self, filter: &RowFilter) -> Self {
        self.filter = Some(filter.to_string());
        self
    }

    pub fn on_insert<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_insert = Some(Arc::new(hook));
        self
    }

    pub fn on_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_update = Some(Arc::new(hook));
        self
    }

    pub fn on_delete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_delete = Some(Arc::new(hook));
        self
    }

    /// Called for every event, after the kind-specific hook
    pub fn on_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_change = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_status_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(SubscriptionStatus) -> HandlerResult + Send + Sync + 'static,
    {
        self.hooks.on_status_change = Some(Arc::new(hook));
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn base_reconnect_delay(mut self, delay: Duration) -> Self {
        self.base_reconnect_delay = Some(delay);
        self
    }

    /// Merge with manager defaults and validate
    pub fn resolve(self, defaults: &RealtimeConfig) -> Result<ResolvedConfig> {
        if self.table.trim().is_empty() {
            return Err(Error::InvalidConfig("table must not be empty".to_string()));
        }

        let filter = self.filter.as_deref().map(RowFilter::parse).transpose()?;
        let base_reconnect_delay = self
            .base_reconnect_delay
            .unwrap_or_else(|| defaults.reconnect.base_delay());
        if base_reconnect_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "base reconnect delay must be greater than zero".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema: self.schema.unwrap_or_else(|| defaults.schema.clone()),
            table: self.table,
            event: self.event,
            filter,
            hooks: self.hooks,
            auto_reconnect: self
                .auto_reconnect
                .unwrap_or(defaults.reconnect.auto_reconnect),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
            base_reconnect_delay,
        })
    }
}

/// Configuration with every default filled in; immutable for the
/// lifetime of the subscription
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
    pub hooks: Hooks,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
}

impl ResolvedConfig {
    pub fn change_filter(&self) -> ChangeFilter {
        ChangeFilter {
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.event,
            row: self.filter.clone(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Pending close of retired channels
pub(crate) type Teardown = Shared<BoxFuture<'static, ()>>;

/// Manager bookkeeping for one logical subscription
pub(crate) struct SubscriptionRecord {
    pub id: String,
    pub config: Arc<ResolvedConfig>,
    pub status: SubscriptionStatus,
    pub reconnect_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<Error>,
    /// Token of the current connection attempt; callbacks from older attempts are ignored
    pub generation: u64,
    pub channel: Option<Arc<dyn ChannelHandle>>,
    pub channel_name: Option<String>,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub teardown: Option<Teardown>,
    pub dispatcher: Dispatcher,
}

impl SubscriptionRecord {
    pub fn new(id: String, config: Arc<ResolvedConfig>, dispatcher: Dispatcher) -> Self {
        Self {
            id,
            config,
            status: SubscriptionStatus::Idle,
            reconnect_attempts: 0,
            created_at: Utc::now(),
            last_error: None,
            generation: RETIRED,
            channel: None,
            channel_name: None,
            reconnect_timer: None,
            teardown: None,
            dispatcher,
        }
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id.clone(),
            schema: self.config.schema.clone(),
            table: self.config.table.clone(),
            event: self.config.event,
            filter: self.config.filter.as_ref().map(ToString::to_string),
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            created_at: self.created_at,
            last_error: self.last_error.clone(),
            channel: self.channel_name.clone(),
        }
    }
}

/// Point-in-time view of a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<String>,
    pub status: SubscriptionStatus,
    pub reconnect_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<Error>,
    pub channel: Option<String>,
}
