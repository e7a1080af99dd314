//! Subscription lifecycle against a scripted transport

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{settle, MockTransport, Recorder};
use realtime_client::{
    builders, BackoffPolicy, ChangeEvent, Error, EventFilter, MemoryTransport, RealtimeConfig,
    SubscriptionConfig, SubscriptionManager, SubscriptionStatus,
};

use SubscriptionStatus::{Error as Failed, Idle, Subscribed, Subscribing, Unsubscribing};

const BASE: Duration = Duration::from_millis(100);

fn manager(transport: Arc<MockTransport>) -> SubscriptionManager {
    let mut config = RealtimeConfig::default();
    config.reconnect.base_delay_ms = 100;
    SubscriptionManager::with_backoff(
        transport,
        config,
        BackoffPolicy::without_jitter(Duration::from_secs(30)),
    )
}

fn orders() -> SubscriptionConfig {
    SubscriptionConfig::new("orders", EventFilter::All)
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_reconnect() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());
    let recorder = Recorder::new();

    let inserts = Arc::new(AtomicUsize::new(0));
    let counter = inserts.clone();
    let config = recorder.attach(orders().filter("user_id=eq.42").on_insert(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    manager.subscribe("s1", config).unwrap();
    assert_eq!(manager.get_status("s1"), Subscribing);
    settle().await;

    let first = transport.last();
    let filter = first.filter().unwrap();
    assert_eq!(filter.table, "orders");
    assert_eq!(filter.row.unwrap().to_string(), "user_id=eq.42");

    first.open();
    settle().await;
    assert!(manager.is_active("s1"));

    first.deliver(ChangeEvent::insert("public", "orders", json!({"id": 1, "user_id": 42})));
    settle().await;
    assert_eq!(inserts.load(Ordering::SeqCst), 1);

    first.close();
    settle().await;
    assert_eq!(manager.get_status("s1"), Failed);
    assert_eq!(manager.snapshot("s1").unwrap().reconnect_attempts, 1);
    assert!(first.is_closed());
    assert!(manager.snapshot("s1").unwrap().channel.is_none());
    assert!(matches!(recorder.errors()[0], Error::ChannelClosed(_)));

    tokio::time::sleep(BASE).await;
    assert_eq!(manager.get_status("s1"), Subscribing);
    assert_eq!(transport.channel_count(), 2);

    let second = transport.last();
    assert_ne!(second.name, first.name);
    second.open();
    settle().await;

    assert_eq!(manager.get_status("s1"), Subscribed);
    assert_eq!(manager.snapshot("s1").unwrap().reconnect_attempts, 0);
    assert_eq!(
        recorder.statuses(),
        vec![Subscribing, Subscribed, Failed, Subscribing, Subscribed]
    );
    assert_eq!(inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_limit() {
    let transport = MockTransport::new();
    transport.fail_subscribes(true);
    let manager = manager(transport.clone());
    let recorder = Recorder::new();

    manager
        .subscribe("s1", recorder.attach(orders().max_reconnect_attempts(2)))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        recorder.statuses(),
        vec![Subscribing, Failed, Subscribing, Failed, Subscribing, Failed]
    );
    assert_eq!(transport.channel_count(), 3);
    assert_eq!(transport.live_count(), 0);
    assert_eq!(
        recorder.errors().last(),
        Some(&Error::ReconnectExhausted { attempts: 2 })
    );
    assert_eq!(manager.get_status("s1"), Failed);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_between_attempts() {
    let transport = MockTransport::new();
    transport.fail_opens(3);
    let manager = manager(transport.clone());

    manager.subscribe("s1", orders()).unwrap();
    settle().await;
    assert_eq!(transport.log().len(), 1);

    // First retry after 100ms, second after a further 200ms
    tokio::time::sleep(BASE).await;
    assert_eq!(transport.log().len(), 2);
    tokio::time::sleep(BASE).await;
    assert_eq!(transport.log().len(), 2);
    tokio::time::sleep(BASE).await;
    assert_eq!(transport.log().len(), 3);

    tokio::time::sleep(BASE * 4).await;
    assert_eq!(transport.log().len(), 4);
    transport.last().open();
    settle().await;
    assert!(manager.is_active("s1"));
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_when_disabled() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());
    let recorder = Recorder::new();

    manager
        .subscribe("s1", recorder.attach(orders().auto_reconnect(false)))
        .unwrap();
    settle().await;
    transport.last().open();
    settle().await;
    transport.last().close();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(manager.get_status("s1"), Failed);
    assert_eq!(transport.channel_count(), 1);
    assert_eq!(transport.live_count(), 0);
    assert_eq!(recorder.statuses(), vec![Subscribing, Subscribed, Failed]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_is_idempotent() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());
    let recorder = Recorder::new();

    manager.unsubscribe("missing").await;

    manager.subscribe("s1", recorder.attach(orders())).unwrap();
    settle().await;
    transport.last().open();
    settle().await;

    manager.unsubscribe("s1").await;
    manager.unsubscribe("s1").await;
    settle().await;

    assert_eq!(manager.get_status("s1"), Idle);
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(transport.live_count(), 0);
    assert_eq!(
        recorder.statuses(),
        vec![Subscribing, Subscribed, Unsubscribing, Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_cancels_pending_retry() {
    let transport = MockTransport::new();
    transport.fail_opens(1);
    let manager = manager(transport.clone());

    manager.subscribe("s1", orders()).unwrap();
    settle().await;
    assert_eq!(manager.get_status("s1"), Failed);

    manager.unsubscribe("s1").await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.log(), vec!["open-failed:realtime:public:orders:s1:1".to_string()]);
    assert_eq!(manager.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_while_open_in_flight() {
    let transport = MockTransport::new();
    transport.set_open_delay(Duration::from_millis(50));
    let manager = manager(transport.clone());
    let recorder = Recorder::new();

    manager.subscribe("s1", recorder.attach(orders())).unwrap();
    settle().await;
    manager.unsubscribe("s1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The late channel is closed as soon as it arrives
    assert_eq!(transport.channel_count(), 1);
    assert_eq!(transport.live_count(), 0);
    transport.last().open();
    settle().await;
    assert_eq!(recorder.statuses(), vec![Subscribing, Unsubscribing, Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_replacement_closes_old_channel_first() {
    let transport = MockTransport::new();
    transport.set_close_delay(Duration::from_millis(50));
    let manager = manager(transport.clone());

    let old = Recorder::new();
    manager.subscribe("s1", old.attach(orders())).unwrap();
    settle().await;
    let first = transport.last();
    first.open();
    settle().await;

    let new = Recorder::new();
    manager.subscribe("s1", new.attach(orders())).unwrap();
    assert_eq!(manager.subscription_count(), 1);
    settle().await;

    // Old events are dropped once the replacement is registered
    first.deliver(ChangeEvent::insert("public", "orders", json!({"id": 1})));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log = transport.log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], format!("open:{}", first.name));
    assert_eq!(log[1], format!("close:{}", first.name));
    assert!(log[2].starts_with("open:"));

    let second = transport.last();
    second.open();
    second.deliver(ChangeEvent::insert("public", "orders", json!({"id": 2})));
    settle().await;

    assert_eq!(old.event_count(), 0);
    assert_eq!(new.event_count(), 1);
    assert_eq!(old.statuses(), vec![Subscribing, Subscribed, Unsubscribing, Idle]);
    assert_eq!(new.statuses(), vec![Subscribing, Subscribed]);
    assert_eq!(transport.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_hooks_are_isolated() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());

    let panicky = Recorder::new();
    let calm = Recorder::new();
    manager
        .subscribe(
            "a",
            panicky.attach(orders().on_insert(|_| panic!("insert hook exploded"))),
        )
        .unwrap();
    manager
        .subscribe("b", calm.attach(orders().on_insert(|_| Err("nope".into()))))
        .unwrap();
    settle().await;

    let channels = transport.channels();
    for channel in &channels {
        channel.open();
    }
    settle().await;

    for id in 1..=3 {
        for channel in &channels {
            channel.deliver(ChangeEvent::insert("public", "orders", json!({ "id": id })));
        }
    }
    settle().await;

    // on_change still runs after the failing kind-specific hook
    assert_eq!(panicky.event_count(), 3);
    assert_eq!(calm.event_count(), 3);
    assert!(panicky
        .errors()
        .iter()
        .all(|e| matches!(e, Error::HandlerPanicked(_))));
    assert!(calm.errors().iter().all(|e| matches!(e, Error::Handler(_))));
    assert!(manager.is_active("a"));
    assert!(manager.is_active("b"));
}

#[tokio::test(start_paused = true)]
async fn test_events_stay_with_their_subscription() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());
    let a = Recorder::new();
    let b = Recorder::new();

    manager.subscribe("a", a.attach(orders())).unwrap();
    manager
        .subscribe("b", b.attach(SubscriptionConfig::new("users", EventFilter::All)))
        .unwrap();
    settle().await;

    let channels = transport.channels();
    let users = channels.iter().find(|c| c.name.contains(":users:")).unwrap();
    users.open();
    users.deliver(ChangeEvent::insert("public", "users", json!({"id": 7})));
    settle().await;

    assert_eq!(a.event_count(), 0);
    assert_eq!(b.event_count(), 1);
    assert!(!manager.is_active("a"));
}

#[tokio::test(start_paused = true)]
async fn test_active_subscriptions() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());

    for id in ["a", "b", "c"] {
        manager.subscribe(id, orders()).unwrap();
    }
    settle().await;
    for channel in transport.channels().iter().take(2) {
        channel.open();
    }
    settle().await;

    let mut active: Vec<String> = manager
        .get_active_subscriptions()
        .into_iter()
        .map(|s| s.id)
        .collect();
    active.sort();
    assert_eq!(active.len(), 2);
    assert!(active.iter().all(|id| manager.is_active(id)));
    assert_eq!(manager.subscriptions().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_all_survives_close_failures() {
    let transport = MockTransport::new();
    transport.fail_closes(true);
    let manager = manager(transport.clone());

    for id in ["a", "b", "c"] {
        manager.subscribe(id, orders()).unwrap();
    }
    settle().await;
    for channel in transport.channels() {
        channel.open();
    }
    settle().await;
    assert_eq!(manager.get_active_subscriptions().len(), 3);

    manager.unsubscribe_all().await;

    assert_eq!(manager.subscription_count(), 0);
    assert!(manager.get_active_subscriptions().is_empty());
    assert_eq!(
        transport.log().iter().filter(|l| l.starts_with("close:")).count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_live_channel() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());
    manager.subscribe("s1", orders()).unwrap();

    for round in 0..6 {
        settle().await;
        let channel = transport.last();
        match round % 3 {
            0 => channel.error("server restarted"),
            1 => {
                channel.open();
                settle().await;
                channel.close();
            }
            _ => {
                manager.subscribe("s1", orders()).unwrap();
            }
        }
        assert!(transport.live_count() <= 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.live_count() <= 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_handle_reports_status() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());

    let handle = manager.subscribe("s1", orders()).unwrap();
    assert_eq!(handle.id(), "s1");
    settle().await;
    transport.last().open();
    settle().await;

    assert!(handle.is_active());
    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.table, "orders");
    assert_eq!(snapshot.channel.as_deref(), Some(transport.last().name.as_str()));

    handle.unsubscribe().await;
    assert_eq!(handle.status(), Idle);
    assert!(handle.snapshot().is_none());

    let other = manager.subscribe("s2", orders()).unwrap();
    drop(manager);
    // The in-flight attempt holds the manager until it finishes
    settle().await;
    assert_eq!(other.status(), Idle);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_config_rejected() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());

    assert!(matches!(
        manager.subscribe("", orders()),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        manager.subscribe("s1", orders().filter("user_id")),
        Err(Error::InvalidFilter(_))
    ));
    assert!(matches!(
        manager.subscribe("s1", orders().filter("=eq.4")),
        Err(Error::InvalidFilter(_))
    ));
    assert!(matches!(
        manager.subscribe("s1", SubscriptionConfig::new(" ", EventFilter::All)),
        Err(Error::InvalidConfig(_))
    ));
    settle().await;
    assert_eq!(transport.channel_count(), 0);
    assert_eq!(manager.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bare_filter_value_matches_equal_rows() {
    let transport = MockTransport::new();
    let manager = manager(transport.clone());

    let inserts = Arc::new(AtomicUsize::new(0));
    let counter = inserts.clone();
    manager
        .subscribe(
            "s1",
            orders().filter("user_id=42").on_insert(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    settle().await;
    assert_eq!(transport.channel_count(), 1);

    let channel = transport.last();
    let filter = channel.filter().unwrap();
    assert_eq!(filter.row.as_ref().unwrap().to_string(), "user_id=eq.42");
    channel.open();
    settle().await;
    assert!(manager.is_active("s1"));

    let matching = ChangeEvent::insert("public", "orders", json!({"user_id": 42}));
    let other = ChangeEvent::insert("public", "orders", json!({"user_id": 7}));
    assert!(filter.matches(&matching));
    assert!(!filter.matches(&other));
    channel.deliver(matching);
    settle().await;

    assert_eq!(inserts.load(Ordering::SeqCst), 1);
    assert_eq!(manager.snapshot("s1").unwrap().filter.as_deref(), Some("user_id=eq.42"));
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_during_handshake_closes_late_join() {
    let transport = MockTransport::new();
    transport.set_subscribe_delay(Duration::from_millis(50));
    let manager = manager(transport.clone());

    manager.subscribe("s1", orders()).unwrap();
    settle().await;
    let channel = transport.last();

    manager.unsubscribe("s1").await;
    assert!(channel.is_closed());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.close_count(&channel.name), 2);
    assert_eq!(transport.live_count(), 0);
    assert_eq!(manager.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_replacement_during_handshake_leaves_one_live_channel() {
    let transport = MockTransport::new();
    transport.set_subscribe_delay(Duration::from_millis(50));
    let manager = manager(transport.clone());

    manager.subscribe("s1", orders()).unwrap();
    settle().await;
    manager.subscribe("s1", orders()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.channel_count(), 2);
    assert_eq!(transport.live_count(), 1);
    assert!(transport.channels()[0].is_closed());
}

#[test]
fn test_unsubscribe_outside_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let transport = MockTransport::new();
    let manager = SubscriptionManager::new(transport.clone());

    let handle = runtime.block_on(async {
        let handle = manager.subscribe("s1", orders()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        transport.last().open();
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle
    });
    assert!(handle.is_active());

    futures::executor::block_on(handle.unsubscribe());

    assert_eq!(handle.status(), Idle);
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(transport.live_count(), 0);
}

#[test]
fn test_subscribe_requires_runtime() {
    let manager = SubscriptionManager::new(MockTransport::new());
    assert!(matches!(
        manager.subscribe("s1", orders()),
        Err(Error::NoRuntime(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_memory_transport_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = SubscriptionManager::with_backoff(
        transport.clone(),
        RealtimeConfig::default(),
        BackoffPolicy::without_jitter(Duration::from_secs(30)),
    );
    let recorder = Recorder::new();

    manager
        .subscribe(
            "mine",
            recorder.attach(builders::owned_by("orders", "user_id", 42).base_reconnect_delay(BASE)),
        )
        .unwrap();
    settle().await;
    assert!(manager.is_active("mine"));

    transport.emit_insert("public", "orders", json!({"id": 1, "user_id": 42}));
    transport.emit_insert("public", "orders", json!({"id": 2, "user_id": 7}));
    settle().await;
    assert_eq!(recorder.event_count(), 1);

    assert_eq!(transport.disconnect_all(), 1);
    settle().await;
    assert_eq!(manager.get_status("mine"), Failed);

    tokio::time::sleep(BASE).await;
    assert!(manager.is_active("mine"));
    assert_eq!(transport.open_channel_count(), 1);

    transport.emit_delete("public", "orders", json!({"id": 1, "user_id": 42}));
    settle().await;
    assert_eq!(recorder.event_count(), 2);

    manager.unsubscribe_all().await;
    assert_eq!(transport.open_channel_count(), 0);
}
