//! Subscription manager
//!
//! Owns the `id -> record` map and drives every record through its
//! connect / reconnect / teardown lifecycle. All I/O (opening, subscribing,
//! closing channels) happens outside the map lock; the lock only guards
//! short lookups and assignments.
//!
//! Each connection attempt gets a fresh generation number. Callbacks from a
//! channel carry the generation they were registered under and are ignored
//! once the record has moved on, so a discarded channel can never change a
//! record's state or reach the caller's hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, FutureExt};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use realtime_common::{ChangeEvent, Error, RealtimeConfig, Result};

use crate::backoff::BackoffPolicy;
use crate::channel::{ChannelHandle, ChannelStatus, EventCallback, StatusCallback, Transport};
use crate::routing::{Dispatcher, Notice};
use crate::subscription::{
    SubscriptionConfig, SubscriptionRecord, SubscriptionSnapshot, SubscriptionStatus, Teardown,
};

/// Manages named realtime subscriptions over a [`Transport`]
///
/// Cloning is cheap; clones share the same subscriptions. Independent
/// managers share nothing.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: RealtimeConfig,
    backoff: BackoffPolicy,
    records: RwLock<HashMap<String, SubscriptionRecord>>,
    generations: AtomicU64,
}

impl SubscriptionManager {
    /// Create a manager with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, RealtimeConfig::default())
    }

    /// Create a manager; the backoff policy is derived from `config.reconnect`
    pub fn with_config(transport: Arc<dyn Transport>, config: RealtimeConfig) -> Self {
        let backoff = BackoffPolicy::from_config(&config.reconnect);
        Self::with_backoff(transport, config, backoff)
    }

    pub fn with_backoff(
        transport: Arc<dyn Transport>,
        config: RealtimeConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                backoff,
                records: RwLock::new(HashMap::new()),
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Start a subscription and return immediately
    ///
    /// An existing subscription with the same id is torn down first; the new
    /// one does not open its channel until that teardown has finished.
    /// Connection failures are reported through `on_error` and
    /// `on_status_change`, never returned here. Must be called from within a
    /// tokio runtime.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "subscription id must not be empty".to_string(),
            ));
        }
        let resolved = Arc::new(config.resolve(&self.inner.config)?);
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;

        {
            let mut records = self.inner.records.write();

            let previous = records.remove(&id).map(|mut old| {
                info!("Replacing subscription {}", id);
                if old.status == SubscriptionStatus::Unsubscribing {
                    old.teardown.take()
                } else {
                    Some(self.inner.retire(&mut old, Some(&runtime)))
                }
            });

            let dispatcher = Dispatcher::spawn(id.clone(), Arc::clone(&resolved), &runtime);
            let mut record = SubscriptionRecord::new(id.clone(), resolved, dispatcher);
            record.teardown = previous.flatten();
            self.inner.begin_attempt(&mut record, &runtime);
            records.insert(id.clone(), record);
        }

        info!("Subscribed {}", id);
        Ok(SubscriptionHandle {
            id,
            manager: Arc::downgrade(&self.inner),
        })
    }

    /// Tear down one subscription and wait for its channel to close
    ///
    /// Unknown ids are a no-op. Channel close failures are logged and
    /// swallowed.
    pub async fn unsubscribe(&self, id: &str) {
        self.inner.unsubscribe(id).await;
    }

    /// Tear down every subscription concurrently and wait for all of them
    pub async fn unsubscribe_all(&self) {
        let ids: Vec<String> = self.inner.records.read().keys().cloned().collect();
        info!("Unsubscribing {} subscriptions", ids.len());
        join_all(ids.iter().map(|id| self.inner.unsubscribe(id))).await;
    }

    /// Current status; `Idle` for unknown ids
    pub fn get_status(&self, id: &str) -> SubscriptionStatus {
        self.inner.status(id)
    }

    /// True iff the subscription is `Subscribed`
    pub fn is_active(&self, id: &str) -> bool {
        self.get_status(id) == SubscriptionStatus::Subscribed
    }

    /// Snapshot of every subscription currently `Subscribed`
    pub fn get_active_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.inner
            .records
            .read()
            .values()
            .filter(|r| r.status == SubscriptionStatus::Subscribed)
            .map(SubscriptionRecord::snapshot)
            .collect()
    }

    /// Snapshot of every tracked subscription, whatever its status
    pub fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.inner
            .records
            .read()
            .values()
            .map(SubscriptionRecord::snapshot)
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<SubscriptionSnapshot> {
        self.inner.records.read().get(id).map(SubscriptionRecord::snapshot)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.records.read().len()
    }
}

impl ManagerInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn status(&self, id: &str) -> SubscriptionStatus {
        self.records
            .read()
            .get(id)
            .map_or(SubscriptionStatus::Idle, |r| r.status)
    }

    fn channel_name(&self, record: &SubscriptionRecord, generation: u64) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.config.channel_prefix,
            record.config.schema,
            record.config.table,
            record.id,
            generation
        )
    }

    fn set_status(record: &mut SubscriptionRecord, status: SubscriptionStatus) {
        record.status = status;
        record.dispatcher.send(Notice::Status(status));
    }

    /// Connect sequence, step 1: mark SUBSCRIBING under a new generation and
    /// spawn the attempt. The attempt first waits for any pending teardown.
    fn begin_attempt(self: &Arc<Self>, record: &mut SubscriptionRecord, runtime: &Handle) {
        let generation = self.next_generation();
        let name = self.channel_name(record, generation);

        record.generation = generation;
        record.channel_name = Some(name.clone());
        record.dispatcher.set_live(generation);
        Self::set_status(record, SubscriptionStatus::Subscribing);

        let teardown = record.teardown.take();
        runtime.spawn(Arc::clone(self).run_attempt(
            record.id.clone(),
            generation,
            name,
            teardown,
        ));
    }

    async fn run_attempt(
        self: Arc<Self>,
        id: String,
        generation: u64,
        name: String,
        teardown: Option<Teardown>,
    ) {
        if let Some(teardown) = teardown {
            teardown.await;
        }

        let filter = {
            let records = self.records.read();
            match records.get(&id) {
                Some(r) if r.generation == generation => r.config.change_filter(),
                _ => return,
            }
        };

        debug!("Opening channel {} for {}", name, id);
        let channel = match self.transport.open_channel(&name).await {
            Ok(channel) => channel,
            Err(err) => {
                let runtime = Handle::current();
                self.handle_failure(&id, generation, open_error(&name, err), &runtime);
                return;
            }
        };

        let installed = {
            let mut records = self.records.write();
            match records.get_mut(&id) {
                Some(r) if r.generation == generation => {
                    r.channel = Some(Arc::clone(&channel));
                    true
                }
                _ => false,
            }
        };
        if !installed {
            debug!("Closing channel {} opened for a superseded attempt", name);
            close_quietly(self.transport.as_ref(), channel).await;
            return;
        }

        let weak = Arc::downgrade(&self);
        let event_id = id.clone();
        let on_event: EventCallback = Arc::new(move |event: ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.route_event(&event_id, generation, event);
            }
        });
        channel.on_event(filter, on_event);

        let weak = Arc::downgrade(&self);
        let status_id = id.clone();
        let runtime = Handle::current();
        let on_status: StatusCallback = Arc::new(move |status: ChannelStatus| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_channel_status(&status_id, generation, status, &runtime);
            }
        });

        let subscribed = channel.subscribe(on_status).await;

        // Retired while the handshake was in flight: the transport may have
        // completed the join after the teardown closed it
        let current = self
            .records
            .read()
            .get(&id)
            .map_or(false, |r| r.generation == generation);
        if !current {
            debug!("Closing channel {} joined by a superseded attempt", name);
            close_quietly(self.transport.as_ref(), channel).await;
            return;
        }

        if let Err(err) = subscribed {
            let runtime = Handle::current();
            self.handle_failure(&id, generation, open_error(&name, err), &runtime);
        }
    }

    fn route_event(&self, id: &str, generation: u64, event: ChangeEvent) {
        let records = self.records.read();
        match records.get(id) {
            Some(r)
                if r.generation == generation
                    && matches!(
                        r.status,
                        SubscriptionStatus::Subscribing | SubscriptionStatus::Subscribed
                    ) =>
            {
                r.dispatcher.send(Notice::Event { generation, event });
            }
            _ => debug!("Dropping event {} from stale channel of {}", event.id, id),
        }
    }

    fn handle_channel_status(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        status: ChannelStatus,
        runtime: &Handle,
    ) {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if record.generation != generation {
            debug!("Ignoring {} from superseded channel of {}", status, id);
            return;
        }
        let channel = record.channel_name.clone().unwrap_or_default();

        match (status, record.status) {
            (ChannelStatus::Opened, SubscriptionStatus::Subscribing) => {
                record.reconnect_attempts = 0;
                record.last_error = None;
                Self::set_status(record, SubscriptionStatus::Subscribed);
                info!("Subscription {} is live on {}", id, channel);
            }
            (ChannelStatus::Closed, SubscriptionStatus::Subscribed) => {
                warn!("Channel {} for {} disconnected", channel, id);
                self.fail(record, Error::ChannelClosed(channel), runtime);
            }
            (ChannelStatus::Closed, SubscriptionStatus::Subscribing) => {
                warn!("Channel {} for {} closed before opening", channel, id);
                let reason = "closed before subscribe completed".to_string();
                self.fail(record, Error::ChannelError { channel, reason }, runtime);
            }
            (
                ChannelStatus::Error(reason),
                SubscriptionStatus::Subscribing | SubscriptionStatus::Subscribed,
            ) => {
                warn!("Channel {} for {} failed: {}", channel, id, reason);
                self.fail(record, Error::ChannelError { channel, reason }, runtime);
            }
            (status, current) => {
                debug!("Ignoring {} for {} while {}", status, id, current);
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, id: &str, generation: u64, error: Error, runtime: &Handle) {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record)
                if record.generation == generation
                    && matches!(
                        record.status,
                        SubscriptionStatus::Subscribing | SubscriptionStatus::Subscribed
                    ) =>
            {
                warn!("Subscription {} failed: {}", id, error);
                self.fail(record, error, runtime);
            }
            _ => debug!("Ignoring failure of superseded attempt for {}: {}", id, error),
        }
    }

    /// Record the error, move to ERROR, discard the channel and maybe retry
    fn fail(self: &Arc<Self>, record: &mut SubscriptionRecord, error: Error, runtime: &Handle) {
        record.last_error = Some(error.clone());
        record.status = SubscriptionStatus::Error;
        record.channel_name = None;
        record.dispatcher.send(Notice::Error(error));
        record.dispatcher.send(Notice::Status(SubscriptionStatus::Error));

        if let Some(channel) = record.channel.take() {
            let previous = record.teardown.take();
            let transport = Arc::clone(&self.transport);
            let teardown = async move {
                if let Some(previous) = previous {
                    previous.await;
                }
                close_quietly(transport.as_ref(), channel).await;
            }
            .boxed()
            .shared();
            runtime.spawn(teardown.clone());
            record.teardown = Some(teardown);
        }

        if record.config.auto_reconnect {
            self.schedule_reconnect(record, runtime);
        } else {
            info!("Subscription {} stopped; auto reconnect is disabled", record.id);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, record: &mut SubscriptionRecord, runtime: &Handle) {
        let max = record.config.max_reconnect_attempts;
        if record.reconnect_attempts >= max {
            warn!(
                "Subscription {} giving up after {} reconnect attempts",
                record.id, record.reconnect_attempts
            );
            record.cancel_reconnect();
            record.dispatcher.send(Notice::Error(Error::ReconnectExhausted {
                attempts: record.reconnect_attempts,
            }));
            return;
        }

        let delay = self
            .backoff
            .compute_delay(record.reconnect_attempts, record.config.base_reconnect_delay);
        record.reconnect_attempts += 1;
        info!(
            "Reconnecting {} in {:?} (attempt {}/{})",
            record.id, delay, record.reconnect_attempts, max
        );

        record.cancel_reconnect();
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = record.id.clone();
        let generation = record.generation;
        record.reconnect_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect(&id, generation);
            }
        }));
    }

    fn fire_reconnect(self: &Arc<Self>, id: &str, generation: u64) {
        let runtime = Handle::current();
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if record.generation != generation || record.status != SubscriptionStatus::Error {
            debug!("Skipping stale reconnect timer for {}", id);
            return;
        }
        // This is the running timer task; detach rather than abort it
        record.reconnect_timer = None;
        self.begin_attempt(record, &runtime);
    }

    /// Cancel the timer, invalidate callbacks, and close the channel in the
    /// background. The returned teardown resolves once the channel (and any
    /// earlier teardown) is closed, the record is removed if it is still the
    /// retired one, and IDLE has been reported.
    fn retire(
        self: &Arc<Self>,
        record: &mut SubscriptionRecord,
        runtime: Option<&Handle>,
    ) -> Teardown {
        record.cancel_reconnect();

        let token = self.next_generation();
        record.generation = token;
        record.dispatcher.retire();
        Self::set_status(record, SubscriptionStatus::Unsubscribing);

        let previous = record.teardown.take();
        let channel = record.channel.take();
        record.channel_name = None;

        let weak = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let id = record.id.clone();
        let dispatcher = record.dispatcher.clone();
        let teardown = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            if let Some(channel) = channel {
                close_quietly(transport.as_ref(), channel).await;
            }
            if let Some(inner) = weak.upgrade() {
                let mut records = inner.records.write();
                if records.get(&id).map_or(false, |r| r.generation == token) {
                    records.remove(&id);
                }
            }
            dispatcher.send(Notice::Status(SubscriptionStatus::Idle));
        }
        .boxed()
        .shared();

        // Without a runtime the caller drives the teardown by awaiting it
        if let Some(runtime) = runtime {
            runtime.spawn(teardown.clone());
        }
        record.teardown = Some(teardown.clone());
        teardown
    }

    async fn unsubscribe(self: &Arc<Self>, id: &str) {
        let teardown = {
            let mut records = self.records.write();
            match records.get_mut(id) {
                None => {
                    debug!("Unsubscribe of unknown subscription {} ignored", id);
                    return;
                }
                Some(record) if record.status == SubscriptionStatus::Unsubscribing => {
                    record.teardown.clone()
                }
                Some(record) => {
                    let runtime = Handle::try_current().ok();
                    Some(self.retire(record, runtime.as_ref()))
                }
            }
        };

        if let Some(teardown) = teardown {
            teardown.await;
        }
        info!("Unsubscribed {}", id);
    }
}

/// Connect failures always take the retry path, so they are reported as
/// transport errors
fn open_error(channel: &str, err: Error) -> Error {
    if err.is_retryable() {
        err
    } else {
        Error::ChannelOpen {
            channel: channel.to_string(),
            reason: err.to_string(),
        }
    }
}

async fn close_quietly(transport: &dyn Transport, channel: Arc<dyn ChannelHandle>) {
    let name = channel.name().to_string();
    match transport.close_channel(channel).await {
        Ok(()) => debug!("Closed channel {}", name),
        Err(err) => warn!("Failed to close channel {}: {}", name, err),
    }
}

/// Caller's handle to one subscription
///
/// Holds a weak reference; once the manager is dropped the handle reports
/// `Idle`.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    manager: Weak<ManagerInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.manager
            .upgrade()
            .map_or(SubscriptionStatus::Idle, |inner| inner.status(&self.id))
    }

    pub fn is_active(&self) -> bool {
        self.status() == SubscriptionStatus::Subscribed
    }

    pub fn snapshot(&self) -> Option<SubscriptionSnapshot> {
        let inner = self.manager.upgrade()?;
        let records = inner.records.read();
        records.get(&self.id).map(SubscriptionRecord::snapshot)
    }

    /// Same as [`SubscriptionManager::unsubscribe`] for this id
    pub async fn unsubscribe(&self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.unsubscribe(&self.id).await;
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
