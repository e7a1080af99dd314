//! In-process transport
//!
//! Routes change events published with [`MemoryTransport::emit`] to every
//! open channel whose filter matches. Useful for local development, the
//! command-line tail, and tests. Failure injection (`fail_next_opens`,
//! `set_online`, `disconnect_all`) exercises the manager's recovery paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use realtime_common::{ChangeEvent, Error, Result};

use crate::channel::{
    ChangeFilter, ChannelHandle, ChannelStatus, EventCallback, StatusCallback, Transport,
};

/// A channel of the in-process transport
pub struct MemoryChannel {
    name: String,
    listener: RwLock<Option<(ChangeFilter, EventCallback)>>,
    status: RwLock<Option<StatusCallback>>,
    open: AtomicBool,
    online: Arc<AtomicBool>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryChannel {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn report(&self, status: ChannelStatus) {
        let callback = self.status.read().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn deliver(&self, event: &ChangeEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        let listener = self.listener.read().clone();
        match listener {
            Some((filter, callback)) if filter.matches(event) => {
                callback(event.clone());
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, filter: ChangeFilter, callback: EventCallback) {
        *self.listener.write() = Some((filter, callback));
    }

    async fn subscribe(&self, status: StatusCallback) -> Result<()> {
        *self.status.write() = Some(status);

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.report(ChannelStatus::Error("injected failure".to_string()));
        } else if !self.online.load(Ordering::SeqCst) {
            self.report(ChannelStatus::Error("transport offline".to_string()));
        } else {
            self.open.store(true, Ordering::SeqCst);
            self.report(ChannelStatus::Opened);
        }
        Ok(())
    }
}

/// In-process transport
pub struct MemoryTransport {
    channels: RwLock<HashMap<String, Arc<MemoryChannel>>>,
    online: Arc<AtomicBool>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
            pending_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an event; returns the number of channels it was delivered to
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let channels: Vec<Arc<MemoryChannel>> = self.channels.read().values().cloned().collect();
        let delivered = channels.iter().filter(|c| c.deliver(&event)).count();
        debug!(
            "Emitted {} on {}.{} to {} channels",
            event.kind, event.schema, event.table, delivered
        );
        delivered
    }

    pub fn emit_insert(&self, schema: &str, table: &str, record: serde_json::Value) -> usize {
        self.emit(ChangeEvent::insert(schema, table, record))
    }

    pub fn emit_update(
        &self,
        schema: &str,
        table: &str,
        old_record: serde_json::Value,
        new_record: serde_json::Value,
    ) -> usize {
        self.emit(ChangeEvent::update(schema, table, old_record, new_record))
    }

    pub fn emit_delete(&self, schema: &str, table: &str, record: serde_json::Value) -> usize {
        self.emit(ChangeEvent::delete(schema, table, record))
    }

    /// Drop every open channel, reporting `Closed` to each
    pub fn disconnect_all(&self) -> usize {
        let dropped: Vec<Arc<MemoryChannel>> = {
            let mut channels = self.channels.write();
            let names: Vec<String> = channels
                .iter()
                .filter(|(_, c)| c.is_open())
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|n| channels.remove(n)).collect()
        };

        for channel in &dropped {
            channel.open.store(false, Ordering::SeqCst);
            channel.report(ChannelStatus::Closed);
        }
        dropped.len()
    }

    /// Make the next `count` subscribe handshakes fail
    pub fn fail_next_opens(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// While offline, `open_channel` fails and handshakes report an error
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Channels opened and not yet closed
    pub fn open_channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn ChannelHandle>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::ChannelOpen {
                channel: name.to_string(),
                reason: "transport offline".to_string(),
            });
        }

        let channel = Arc::new(MemoryChannel {
            name: name.to_string(),
            listener: RwLock::new(None),
            status: RwLock::new(None),
            open: AtomicBool::new(false),
            online: Arc::clone(&self.online),
            pending_failures: Arc::clone(&self.pending_failures),
        });
        self.channels
            .write()
            .insert(name.to_string(), Arc::clone(&channel));
        let handle: Arc<dyn ChannelHandle> = channel;
        Ok(handle)
    }

    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<()> {
        if let Some(removed) = self.channels.write().remove(channel.name()) {
            removed.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}
