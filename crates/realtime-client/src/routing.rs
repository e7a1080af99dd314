//! Event routing and hook isolation
//!
//! Every subscription record owns a [`Dispatcher`]: an ordered queue drained
//! by one task, so hooks never run under the manager's lock and a record's
//! status changes and events reach the caller in the order they happened.
//! A hook that returns an error or panics is logged and reported to
//! `on_error`; it never stops delivery of later events.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use realtime_common::{ChangeEvent, Error, EventKind};

use crate::subscription::{EventHook, HandlerResult, ResolvedConfig, SubscriptionStatus};

/// Generation value that matches no connection attempt
pub(crate) const RETIRED: u64 = 0;

/// Work item for a dispatcher
#[derive(Debug)]
pub(crate) enum Notice {
    Event { generation: u64, event: ChangeEvent },
    Status(SubscriptionStatus),
    Error(Error),
}

/// Ordered hook delivery for one subscription record
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Notice>,
    live: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn spawn(id: String, config: Arc<ResolvedConfig>, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicU64::new(RETIRED));
        runtime.spawn(drain(id, config, rx, Arc::clone(&live)));
        Self { tx, live }
    }

    /// Only events tagged with this generation are delivered from now on
    pub fn set_live(&self, generation: u64) {
        self.live.store(generation, Ordering::SeqCst);
    }

    /// Drop queued and future events; status and error notices still flow
    pub fn retire(&self) {
        self.live.store(RETIRED, Ordering::SeqCst);
    }

    pub fn send(&self, notice: Notice) {
        // The receiver only goes away with the runtime
        let _ = self.tx.send(notice);
    }
}

async fn drain(
    id: String,
    config: Arc<ResolvedConfig>,
    mut rx: mpsc::UnboundedReceiver<Notice>,
    live: Arc<AtomicU64>,
) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Event { generation, event } => {
                if generation != RETIRED && live.load(Ordering::SeqCst) == generation {
                    dispatch_event(&id, &config, &event);
                } else {
                    debug!("Dropping event {} for retired channel of {}", event.id, id);
                }
            }
            Notice::Status(status) => notify_status(&id, &config, status),
            Notice::Error(error) => notify_error(&id, &config, &error),
        }
    }
}

/// Deliver one event: kind-specific hook first, then `on_change`
pub(crate) fn dispatch_event(id: &str, config: &ResolvedConfig, event: &ChangeEvent) {
    debug!(
        "Routing {} on {}.{} to subscription {}",
        event.kind, event.schema, event.table, id
    );

    let hooks = &config.hooks;
    let specific: Option<(&str, &EventHook)> = match event.kind {
        EventKind::Insert => hooks.on_insert.as_ref().map(|h| ("on_insert", h)),
        EventKind::Update => hooks.on_update.as_ref().map(|h| ("on_update", h)),
        EventKind::Delete => hooks.on_delete.as_ref().map(|h| ("on_delete", h)),
    };

    if let Some((name, hook)) = specific {
        if let Some(err) = run_hook(id, name, || hook(event)) {
            notify_error(id, config, &err);
        }
    }

    if let Some(hook) = &hooks.on_change {
        if let Some(err) = run_hook(id, "on_change", || hook(event)) {
            notify_error(id, config, &err);
        }
    }
}

/// Fire `on_status_change`
pub(crate) fn notify_status(id: &str, config: &ResolvedConfig, status: SubscriptionStatus) {
    if let Some(hook) = &config.hooks.on_status_change {
        if let Some(err) = run_hook(id, "on_status_change", || hook(status)) {
            notify_error(id, config, &err);
        }
    }
}

/// Fire `on_error`. Failures of the error hook itself are only logged.
pub(crate) fn notify_error(id: &str, config: &ResolvedConfig, error: &Error) {
    if let Some(hook) = &config.hooks.on_error {
        let _ = run_hook(id, "on_error", || hook(error));
    }
}

fn run_hook<F>(id: &str, name: &str, hook: F) -> Option<Error>
where
    F: FnOnce() -> HandlerResult,
{
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            warn!("Subscription {} {} hook failed: {}", id, name, err);
            Some(Error::Handler(format!("{}: {}", name, err)))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("Subscription {} {} hook panicked: {}", id, name, message);
            Some(Error::HandlerPanicked(format!("{}: {}", name, message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
