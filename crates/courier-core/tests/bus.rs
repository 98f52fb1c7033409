//! End-to-end tests through the public bus API.

use courier_core::{
    BusConfig, BusError, CursorForm, MessageBus, MessageHandler, MessageResult, Subscriber,
};
use courier_protocol::{decode, CursorPosition};
use std::time::Duration;
use tokio::sync::mpsc;

fn config() -> BusConfig {
    BusConfig {
        store_capacity: 128,
        max_workers: 4,
        max_idle_workers: 2,
        sweep_interval_ms: 50,
        max_messages: 100,
        cursor_form: CursorForm::Full,
    }
}

fn channel_handler() -> (impl MessageHandler, mpsc::UnboundedReceiver<MessageResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |result: MessageResult| {
        let _ = tx.send(result);
        async { Ok::<_, BusError>(true) }
    };
    (handler, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<MessageResult>) -> MessageResult {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler dropped")
}

/// Collect deliveries until `count` messages have arrived.
async fn collect_ids(rx: &mut mpsc::UnboundedReceiver<MessageResult>, count: usize) -> Vec<u64> {
    let mut ids = Vec::new();
    while ids.len() < count {
        let result = next(rx).await;
        ids.extend(result.messages.iter().map(|m| m.id));
    }
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_round_trip() {
    let bus = MessageBus::new(config()).unwrap();
    let (handler, mut rx) = channel_handler();
    let handle = bus
        .subscribe(&Subscriber::new("conn-1", ["chat"]), None, None, handler)
        .unwrap();

    bus.publish("server", "chat", "hello").unwrap();

    let result = next(&mut rx).await;
    assert_eq!(result.total_count, 1);
    assert_eq!(result.messages[0].value, "hello");
    assert_eq!(result.messages[0].source, "server");
    assert_eq!(
        decode(&result.cursor).unwrap(),
        vec![CursorPosition::new("chat", 1)]
    );

    handle.dispose().await.unwrap();
    let terminal = next(&mut rx).await;
    assert!(terminal.terminal);
    assert!(terminal.messages.is_empty());
    assert_eq!(terminal.cursor, result.cursor);

    bus.publish("server", "chat", "after").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_delivers_remaining_in_order() {
    let bus = MessageBus::new(config()).unwrap();
    for n in 1..=5 {
        bus.publish("server", "k", format!("m{}", n)).unwrap();
    }

    let (handler, mut rx) = channel_handler();
    let _handle = bus
        .subscribe(
            &Subscriber::new("conn-1", ["k"]),
            Some("k,0000000000000002"),
            None,
            handler,
        )
        .unwrap();

    assert_eq!(collect_ids(&mut rx, 3).await, vec![3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_without_gaps_or_duplicates() {
    let bus = MessageBus::new(config()).unwrap();
    let subscriber = Subscriber::new("conn-1", ["a", "b"]);

    let (handler, mut rx) = channel_handler();
    let handle = bus.subscribe(&subscriber, None, Some(3), handler).unwrap();

    for n in 0..10 {
        bus.publish("p", "a", format!("a{}", n)).unwrap();
        bus.publish("p", "b", format!("b{}", n)).unwrap();
    }

    let mut seen = 0;
    while seen < 20 {
        seen += next(&mut rx).await.total_count;
    }
    assert_eq!(seen, 20);
    handle.dispose().await.unwrap();
    let resume = loop {
        let result = next(&mut rx).await;
        if result.terminal {
            break result.cursor;
        }
    };

    // Published while disconnected.
    for n in 10..15 {
        bus.publish("p", "a", format!("a{}", n)).unwrap();
    }

    let (handler, mut rx) = channel_handler();
    let _handle = bus
        .subscribe_strict(&subscriber, Some(&resume), None, handler)
        .unwrap();

    assert_eq!(collect_ids(&mut rx, 5).await, vec![11, 12, 13, 14, 15]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compact_cursor_omits_unread_topics() {
    let config = BusConfig {
        cursor_form: CursorForm::Compact,
        ..config()
    };
    let bus = MessageBus::new(config).unwrap();
    let (handler, mut rx) = channel_handler();
    let _handle = bus
        .subscribe(&Subscriber::new("conn", ["quiet", "busy"]), None, None, handler)
        .unwrap();

    bus.publish("p", "busy", "x").unwrap();
    let result = next(&mut rx).await;
    assert_eq!(result.cursor, "busy,0000000000000001");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keys_with_separators() {
    let bus = MessageBus::new(config()).unwrap();
    let key = r"room|1,a\b";
    let (handler, mut rx) = channel_handler();
    let _handle = bus
        .subscribe(&Subscriber::new("conn", [key]), None, None, handler)
        .unwrap();

    bus.publish("p", key, "x").unwrap();
    let result = next(&mut rx).await;
    assert_eq!(
        decode(&result.cursor).unwrap(),
        vec![CursorPosition::new(key, 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_subscribers_receive_every_message() {
    let bus = MessageBus::new(config()).unwrap();
    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for n in 0..16 {
        let (handler, rx) = channel_handler();
        handles.push(
            bus.subscribe(&Subscriber::new(format!("conn-{}", n), ["fanout"]), None, None, handler)
                .unwrap(),
        );
        receivers.push(rx);
    }

    for n in 0..50 {
        bus.publish("p", "fanout", format!("{}", n)).unwrap();
    }

    for rx in &mut receivers {
        let ids = collect_ids(rx, 50).await;
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
    }
    assert!(bus.engine().allocated_workers() <= 4);
    assert_eq!(bus.stats().total_subscriptions, 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_handler_does_not_stall_others() {
    let bus = MessageBus::new(config()).unwrap();
    let failing = |_: MessageResult| async { Err::<bool, _>(BusError::handler("client gone")) };
    let _bad = bus
        .subscribe(&Subscriber::new("bad", ["k"]), None, None, failing)
        .unwrap();

    let (handler, mut rx) = channel_handler();
    let _good = bus
        .subscribe(&Subscriber::new("good", ["k"]), None, None, handler)
        .unwrap();

    for n in 0..5 {
        bus.publish("p", "k", format!("{}", n)).unwrap();
    }
    assert_eq!(collect_ids(&mut rx, 5).await, vec![1, 2, 3, 4, 5]);
}
