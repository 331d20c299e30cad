use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::message::BroadcastMessage;

/// Depth of each listener's private queue. A listener that lets this many
/// messages pile up is evicted rather than allowed to stall the category.
pub const LISTENER_QUEUE_DEPTH: usize = 10;

/// Meter samples arrive 25 times a second, so that category gets more slack.
pub const METER_QUEUE_DEPTH: usize = 100;

/// With no traffic for this long every listener gets a ping instead.
pub const IDLE_PING_INTERVAL: Duration = Duration::from_secs(2);

type ListenerMap = Arc<Mutex<HashMap<String, SyncSender<BroadcastMessage>>>>;

/// A subscriber's receiving half. Dropping it (or seeing `None`) ends the
/// subscription; the distribution side cleans up on its next send.
pub struct Listener {
    rx: Receiver<BroadcastMessage>,
}

impl Listener {
    pub fn recv(&self) -> Option<BroadcastMessage> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<BroadcastMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<BroadcastMessage> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out for one message category: a single intake feeding every
/// registered listener's bounded queue from a dedicated thread.
pub struct QueueHandler {
    name: &'static str,
    capacity: usize,
    listeners: ListenerMap,
    started: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl QueueHandler {
    /// Starts the distribution thread. `convert` turns an intake item into
    /// the wire message; returning `None` is the shutdown sentinel.
    pub fn spawn<I, F>(name: &'static str, capacity: usize, intake: Receiver<I>, mut convert: F) -> Self
    where
        I: Send + 'static,
        F: FnMut(I) -> Option<BroadcastMessage> + Send + 'static,
    {
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let started = Arc::new(AtomicBool::new(true));

        let map = listeners.clone();
        let running = started.clone();
        let thread = std::thread::Builder::new()
            .name(format!("queue-{}", name))
            .spawn(move || {
                loop {
                    match intake.recv_timeout(IDLE_PING_INTERVAL) {
                        Ok(item) => match convert(item) {
                            Some(message) => distribute(name, &map, message),
                            None => break,
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            distribute(name, &map, BroadcastMessage::Ping)
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
                close_all(name, &map);
                debug!("{} queue handler stopped", name);
            })
            .expect("queue handler thread");

        QueueHandler {
            name,
            capacity,
            listeners,
            started,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Registers a listener and primes its queue with the open
    /// acknowledgment and an optional history reload. Returns `None` once
    /// the handler has shut down or if the session id is empty.
    pub fn add_listener(
        &self,
        session_id: &str,
        remote: &str,
        reload: Option<BroadcastMessage>,
    ) -> Option<Listener> {
        if session_id.is_empty() || !self.started.load(Ordering::SeqCst) {
            return None;
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(self.capacity);
        let _ = tx.send(BroadcastMessage::Open {
            session_id: session_id.to_string(),
        });
        if let Some(message) = reload {
            let _ = tx.send(message);
        }

        let previous = self
            .listeners
            .lock()
            .unwrap()
            .insert(session_id.to_string(), tx);
        if previous.is_some() {
            warn!(
                "{} listener {} replaced an existing registration",
                self.name, session_id
            );
        }
        info!("{} listener {} added from {}", self.name, session_id, remote);

        Some(Listener { rx })
    }

    pub fn remove_listener(&self, session_id: &str) -> bool {
        let removed = self.listeners.lock().unwrap().remove(session_id);
        if let Some(tx) = removed {
            let _ = tx.try_send(BroadcastMessage::Close);
            info!("{} listener {} removed", self.name, session_id);
            true
        } else {
            false
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn listener_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.listeners.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Closes and deregisters every listener. The distribution thread keeps
    /// running and new listeners can attach afterwards.
    pub fn close_listeners(&self) {
        close_all(self.name, &self.listeners);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits for the distribution thread after its intake has been closed.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn distribute(name: &'static str, map: &ListenerMap, message: BroadcastMessage) {
    let mut evicted = Vec::new();
    {
        let listeners = map.lock().unwrap();
        for (id, tx) in listeners.iter() {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("{} listener {} is not keeping up, evicting", name, id);
                    evicted.push(id.clone());
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("{} listener {} went away", name, id);
                    evicted.push(id.clone());
                }
            }
        }
    }

    if !evicted.is_empty() {
        let mut listeners = map.lock().unwrap();
        for id in evicted {
            if let Some(tx) = listeners.remove(&id) {
                // A queue full enough to trigger eviction cannot take the
                // close marker; such listeners observe the dropped sender
                // as their terminal signal instead.
                let _ = tx.try_send(BroadcastMessage::Close);
            }
        }
    }
}

fn close_all(name: &'static str, map: &ListenerMap) {
    let mut listeners = map.lock().unwrap();
    for (id, tx) in listeners.drain() {
        let _ = tx.try_send(BroadcastMessage::Close);
        debug!("{} listener {} closed at shutdown", name, id);
    }
}
