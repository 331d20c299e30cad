use std::sync::Arc;
use std::time::Duration;

use captioncast::broadcast::{BroadcastMessage, Finality, ListenerCategory, QueueManager};
use captioncast::logging::LogTap;
use captioncast::transcript::TranscriptStore;

fn manager(dir: &std::path::Path) -> (QueueManager, Arc<TranscriptStore>) {
    let store = Arc::new(TranscriptStore::new());
    let tap = LogTap::detached(dir.join("captioncast.log"));
    (QueueManager::new(tap, store.clone()), store)
}

fn transcript(text: &str) -> BroadcastMessage {
    BroadcastMessage::Transcript {
        finality: Finality::Final,
        record: text.to_string(),
        time: 1.0,
    }
}

#[test]
fn listener_gets_open_then_history_reload() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, store) = manager(dir.path());

    store.open_session(&dir.path().join("session.txt")).unwrap();
    store.append_final("hello there").unwrap();
    store.append_final("general").unwrap();

    let listener = queues
        .add_listener(ListenerCategory::Transcript, "s1", "test")
        .unwrap();

    match listener.recv().unwrap() {
        BroadcastMessage::Open { session_id } => assert_eq!(session_id, "s1"),
        other => panic!("expected open, got {:?}", other),
    }
    match listener.recv().unwrap() {
        BroadcastMessage::Transcript {
            finality, record, ..
        } => {
            assert_eq!(finality, Finality::Reload);
            assert_eq!(record, "<p>hello there</p><p>general</p>");
        }
        other => panic!("expected reload, got {:?}", other),
    }

    queues.shutdown();
}

#[test]
fn every_listener_sees_messages_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let a = queues
        .add_listener(ListenerCategory::Transcript, "a", "test")
        .unwrap();
    let b = queues
        .add_listener(ListenerCategory::Transcript, "b", "test")
        .unwrap();

    for text in ["one", "two", "three"] {
        queues.publish_transcript(transcript(text));
    }

    for listener in [&a, &b] {
        assert!(matches!(
            listener.recv().unwrap(),
            BroadcastMessage::Open { .. }
        ));
        for expected in ["one", "two", "three"] {
            match listener.recv_timeout(Duration::from_secs(1)).unwrap() {
                BroadcastMessage::Transcript { record, .. } => assert_eq!(record, expected),
                other => panic!("expected transcript, got {:?}", other),
            }
        }
    }

    queues.shutdown();
}

#[test]
fn slow_listener_is_evicted_not_waited_for() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let listener = queues
        .add_listener(ListenerCategory::Transcript, "slow", "test")
        .unwrap();
    let usage = queues.get_usage().transcript;
    assert_eq!(usage.count, 1);
    assert_eq!(usage.listeners, vec!["slow".to_string()]);

    // Never consume; well past the queue depth the listener must go.
    for i in 0..20 {
        queues.publish_transcript(transcript(&format!("m{}", i)));
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while queues.get_usage().transcript.count != 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(queues.get_usage().transcript.count, 0);

    // The queue ends in a close sentinel or a plain disconnect.
    let mut ended = false;
    for _ in 0..20 {
        match listener.try_recv() {
            Some(BroadcastMessage::Close) => {
                ended = true;
                break;
            }
            Some(_) => {}
            None => {
                ended = true;
                break;
            }
        }
    }
    assert!(ended);

    queues.shutdown();
}

#[test]
fn idle_listener_gets_pings() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let listener = queues
        .add_listener(ListenerCategory::Transcript, "idle", "test")
        .unwrap();
    assert!(matches!(
        listener.recv().unwrap(),
        BroadcastMessage::Open { .. }
    ));

    match listener.recv_timeout(Duration::from_secs(4)) {
        Some(BroadcastMessage::Ping) => {}
        other => panic!("expected ping, got {:?}", other),
    }

    queues.shutdown();
}

#[test]
fn log_lines_are_republished_with_reload() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("captioncast.log");
    std::fs::write(&log_path, "older line\nnewer line\n").unwrap();

    let store = Arc::new(TranscriptStore::new());
    let tap = LogTap::detached(log_path);
    let log_tx = tap.sender.clone();
    let queues = QueueManager::new(tap, store);

    let listener = queues
        .add_listener(ListenerCategory::Log, "logs", "test")
        .unwrap();
    assert!(matches!(
        listener.recv().unwrap(),
        BroadcastMessage::Open { .. }
    ));
    match listener.recv().unwrap() {
        BroadcastMessage::LogRecord { finality, record } => {
            assert_eq!(finality, Finality::Reload);
            assert_eq!(record, "<p>older line</p><p>newer line</p>");
        }
        other => panic!("expected reload, got {:?}", other),
    }

    log_tx.send(Some("fresh line".to_string())).unwrap();
    match listener.recv_timeout(Duration::from_secs(1)).unwrap() {
        BroadcastMessage::LogRecord { finality, record } => {
            assert_eq!(finality, Finality::Final);
            assert_eq!(record, "fresh line");
        }
        other => panic!("expected log record, got {:?}", other),
    }

    queues.shutdown();
}

#[test]
fn meter_samples_flow_to_meter_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let listener = queues
        .add_listener(ListenerCategory::Meter, "meter", "test")
        .unwrap();
    assert!(matches!(
        listener.recv().unwrap(),
        BroadcastMessage::Open { .. }
    ));

    queues
        .meter_sender()
        .send(Some(captioncast::audio_toolkit::LoudnessSample {
            time: 0.04,
            rms_db: -42,
            peak_db: -20,
        }))
        .unwrap();

    match listener.recv_timeout(Duration::from_secs(1)).unwrap() {
        BroadcastMessage::MeterRecord { record } => {
            assert_eq!(record.rms_db, -42);
            assert_eq!(record.peak_db, -20);
        }
        other => panic!("expected meter record, got {:?}", other),
    }

    queues.shutdown();
}

#[test]
fn close_all_listeners_leaves_manager_usable() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let a = queues
        .add_listener(ListenerCategory::Transcript, "a", "test")
        .unwrap();
    let _b = queues
        .add_listener(ListenerCategory::Log, "b", "test")
        .unwrap();

    queues.close_all_listeners();

    let usage = queues.get_usage();
    assert_eq!(usage.transcript.count, 0);
    assert_eq!(usage.log.count, 0);
    assert_eq!(usage.meter.count, 0);

    // The closed listener drains to a terminal close sentinel.
    let mut saw_end = false;
    for _ in 0..10 {
        match a.recv_timeout(Duration::from_secs(1)) {
            Some(BroadcastMessage::Close) | None => {
                saw_end = true;
                break;
            }
            Some(_) => {}
        }
    }
    assert!(saw_end);

    // Distribution is still live: a fresh listener attaches and gets traffic.
    let c = queues
        .add_listener(ListenerCategory::Transcript, "c", "test")
        .unwrap();
    assert!(matches!(c.recv().unwrap(), BroadcastMessage::Open { .. }));
    queues.publish_transcript(transcript("after close"));
    match c.recv_timeout(Duration::from_secs(1)).unwrap() {
        BroadcastMessage::Transcript { record, .. } => assert_eq!(record, "after close"),
        other => panic!("expected transcript, got {:?}", other),
    }

    queues.shutdown();
}

#[test]
fn shutdown_closes_listeners_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (queues, _store) = manager(dir.path());

    let listener = queues
        .add_listener(ListenerCategory::Transcript, "s", "test")
        .unwrap();

    queues.shutdown();
    queues.shutdown();

    // Drain to the end; the subscription is over.
    let mut saw_end = false;
    for _ in 0..10 {
        match listener.recv_timeout(Duration::from_secs(1)) {
            Some(BroadcastMessage::Close) | None => {
                saw_end = true;
                break;
            }
            Some(_) => {}
        }
    }
    assert!(saw_end);

    let usage = queues.get_usage();
    assert_eq!(usage.transcript.count, 0);
    assert_eq!(usage.log.count, 0);
    assert_eq!(usage.meter.count, 0);

    assert!(queues
        .add_listener(ListenerCategory::Transcript, "late", "test")
        .is_none());
}
