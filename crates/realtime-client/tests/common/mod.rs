//! Scripted transport and recording hooks shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use realtime_client::{
    ChangeEvent, ChangeFilter, ChannelHandle, ChannelStatus, Error, EventCallback, Result,
    StatusCallback, SubscriptionConfig, SubscriptionStatus, Transport,
};

/// Channel whose status and events are driven by the test
pub struct MockChannel {
    pub name: String,
    listener: Mutex<Option<(ChangeFilter, EventCallback)>>,
    status: Mutex<Option<StatusCallback>>,
    closed: AtomicBool,
    fail_on_subscribe: bool,
    subscribe_delay: Option<Duration>,
}

impl MockChannel {
    pub fn filter(&self) -> Option<ChangeFilter> {
        self.listener.lock().as_ref().map(|(f, _)| f.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, status: ChannelStatus) {
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    pub fn open(&self) {
        self.report(ChannelStatus::Opened);
    }

    pub fn close(&self) {
        self.report(ChannelStatus::Closed);
    }

    pub fn error(&self, reason: &str) {
        self.report(ChannelStatus::Error(reason.to_string()));
    }

    pub fn deliver(&self, event: ChangeEvent) {
        let listener = self.listener.lock().clone();
        if let Some((_, callback)) = listener {
            callback(event);
        }
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, filter: ChangeFilter, callback: EventCallback) {
        *self.listener.lock() = Some((filter, callback));
    }

    async fn subscribe(&self, status: StatusCallback) -> Result<()> {
        *self.status.lock() = Some(status);
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
            // A late join leaves the connection live even if it was closed meanwhile
            self.closed.store(false, Ordering::SeqCst);
        }
        if self.fail_on_subscribe {
            self.error("handshake rejected");
        }
        Ok(())
    }
}

/// Transport that records every open and close in order
#[derive(Default)]
pub struct MockTransport {
    channels: Mutex<Vec<Arc<MockChannel>>>,
    log: Mutex<Vec<String>>,
    fail_subscribes: AtomicBool,
    fail_opens: AtomicUsize,
    fail_closes: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    close_delay: Mutex<Option<Duration>>,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn last(&self) -> Arc<MockChannel> {
        self.channels
            .lock()
            .last()
            .cloned()
            .expect("no channel opened")
    }

    /// Channels opened and not yet closed
    pub fn live_count(&self) -> usize {
        self.channels.lock().iter().filter(|c| !c.is_closed()).count()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Every subscribe handshake reports an error
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// The next `count` `open_channel` calls return an error
    pub fn fail_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    /// Subscribe handshakes take `delay` to complete
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock() = Some(delay);
    }

    pub fn close_count(&self, name: &str) -> usize {
        let entry = format!("close:{}", name);
        self.log.lock().iter().filter(|l| **l == entry).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn ChannelHandle>> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.log.lock().push(format!("open-failed:{}", name));
            return Err(Error::ChannelOpen {
                channel: name.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let channel = Arc::new(MockChannel {
            name: name.to_string(),
            listener: Mutex::new(None),
            status: Mutex::new(None),
            closed: AtomicBool::new(false),
            fail_on_subscribe: self.fail_subscribes.load(Ordering::SeqCst),
            subscribe_delay: *self.subscribe_delay.lock(),
        });
        self.log.lock().push(format!("open:{}", name));
        self.channels.lock().push(Arc::clone(&channel));
        let handle: Arc<dyn ChannelHandle> = channel;
        Ok(handle)
    }

    async fn close_channel(&self, channel: Arc<dyn ChannelHandle>) -> Result<()> {
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let name = channel.name().to_string();
        if let Some(c) = self.channels.lock().iter().find(|c| c.name == name) {
            c.closed.store(true, Ordering::SeqCst);
        }
        self.log.lock().push(format!("close:{}", name));

        if self.fail_closes.load(Ordering::SeqCst) {
            return Err(Error::ChannelError {
                channel: name,
                reason: "close timed out".to_string(),
            });
        }
        Ok(())
    }
}

/// Captures everything a subscription reports
#[derive(Clone, Default)]
pub struct Recorder {
    pub statuses: Arc<Mutex<Vec<SubscriptionStatus>>>,
    pub errors: Arc<Mutex<Vec<Error>>>,
    pub events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add status, error and change hooks that record into this recorder
    pub fn attach(&self, config: SubscriptionConfig) -> SubscriptionConfig {
        let statuses = Arc::clone(&self.statuses);
        let errors = Arc::clone(&self.errors);
        let events = Arc::clone(&self.events);
        config
            .on_status_change(move |status| {
                statuses.lock().push(status);
                Ok(())
            })
            .on_error(move |err| {
                errors.lock().push(err.clone());
                Ok(())
            })
            .on_change(move |event| {
                events.lock().push(event.clone());
                Ok(())
            })
    }

    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        self.statuses.lock().clone()
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

/// Let every ready task run; with a paused clock this only advances 1ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
