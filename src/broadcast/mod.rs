pub mod handler;
pub mod message;

pub use handler::{Listener, IDLE_PING_INTERVAL, LISTENER_QUEUE_DEPTH, METER_QUEUE_DEPTH};
pub use message::{BroadcastMessage, Finality};

use log::warn;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

use crate::audio_toolkit::LoudnessSample;
use crate::logging::LogTap;
use crate::transcript::TranscriptStore;
use handler::QueueHandler;

/// The three message categories a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCategory {
    Transcript,
    Log,
    Meter,
}

/// Active listeners of one category: how many and who.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CategoryUsage {
    pub count: usize,
    pub listeners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Usage {
    pub transcript: CategoryUsage,
    pub log: CategoryUsage,
    pub meter: CategoryUsage,
}

/// Owns the three fan-out handlers and the intakes that feed them.
///
/// Transcript messages come from the engine, meter samples from the audio
/// callback, and log lines from the logger's tap. Each category runs on its
/// own distribution thread until `shutdown`.
pub struct QueueManager {
    transcript: QueueHandler,
    log: QueueHandler,
    meter: QueueHandler,
    transcript_tx: Sender<Option<BroadcastMessage>>,
    meter_tx: Sender<Option<LoudnessSample>>,
    log_tx: Sender<Option<String>>,
    log_path: PathBuf,
    store: Arc<TranscriptStore>,
}

impl QueueManager {
    pub fn new(tap: LogTap, store: Arc<TranscriptStore>) -> Self {
        let (transcript_tx, transcript_rx) = channel::<Option<BroadcastMessage>>();
        let transcript =
            QueueHandler::spawn("transcript", LISTENER_QUEUE_DEPTH, transcript_rx, |i| i);

        let log_tx = tap.sender.clone();
        let log = QueueHandler::spawn("log", LISTENER_QUEUE_DEPTH, tap.lines, |line| {
            line.map(|record| BroadcastMessage::LogRecord {
                finality: Finality::Final,
                record,
            })
        });

        let (meter_tx, meter_rx) = channel::<Option<LoudnessSample>>();
        let meter = QueueHandler::spawn("meter", METER_QUEUE_DEPTH, meter_rx, |sample| {
            sample.map(|record| BroadcastMessage::MeterRecord { record })
        });

        QueueManager {
            transcript,
            log,
            meter,
            transcript_tx,
            meter_tx,
            log_tx,
            log_path: tap.file_path,
            store,
        }
    }

    /// Queues a message to every transcript listener.
    pub fn publish_transcript(&self, message: BroadcastMessage) {
        let _ = self.transcript_tx.send(Some(message));
    }

    /// Intake for the audio layer's loudness samples.
    pub fn meter_sender(&self) -> Sender<Option<LoudnessSample>> {
        self.meter_tx.clone()
    }

    /// Registers a listener, priming it with the category's history where
    /// one exists. Returns `None` after shutdown or for an empty session id.
    pub fn add_listener(
        &self,
        category: ListenerCategory,
        session_id: &str,
        remote: &str,
    ) -> Option<Listener> {
        match category {
            ListenerCategory::Transcript => {
                let reload = self.store.render_history().map(|html| {
                    BroadcastMessage::Transcript {
                        finality: Finality::Reload,
                        record: html,
                        time: 0.0,
                    }
                });
                self.transcript.add_listener(session_id, remote, reload)
            }
            ListenerCategory::Log => {
                let reload = self.render_log_history().map(|html| {
                    BroadcastMessage::LogRecord {
                        finality: Finality::Reload,
                        record: html,
                    }
                });
                self.log.add_listener(session_id, remote, reload)
            }
            ListenerCategory::Meter => self.meter.add_listener(session_id, remote, None),
        }
    }

    pub fn remove_listener(&self, category: ListenerCategory, session_id: &str) -> bool {
        self.handler(category).remove_listener(session_id)
    }

    /// Drops every listener in every category without stopping distribution.
    /// Unlike `shutdown`, the manager stays usable and new listeners can
    /// attach afterwards.
    pub fn close_all_listeners(&self) {
        self.transcript.close_listeners();
        self.log.close_listeners();
        self.meter.close_listeners();
    }

    pub fn get_usage(&self) -> Usage {
        let usage_of = |handler: &QueueHandler| CategoryUsage {
            count: handler.listener_count(),
            listeners: handler.listener_ids(),
        };
        Usage {
            transcript: usage_of(&self.transcript),
            log: usage_of(&self.log),
            meter: usage_of(&self.meter),
        }
    }

    /// Stops all three distribution threads, closing every listener. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        let _ = self.transcript_tx.send(None);
        let _ = self.log_tx.send(None);
        let _ = self.meter_tx.send(None);
        self.transcript.join();
        self.log.join();
        self.meter.join();
    }

    fn handler(&self, category: ListenerCategory) -> &QueueHandler {
        match category {
            ListenerCategory::Transcript => &self.transcript,
            ListenerCategory::Log => &self.log,
            ListenerCategory::Meter => &self.meter,
        }
    }

    /// The accumulated log file as one paragraph-per-line HTML payload.
    fn render_log_history(&self) -> Option<String> {
        let contents = match std::fs::read_to_string(&self.log_path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read log history: {}", e);
                }
                return None;
            }
        };
        let trimmed = contents.trim_end_matches('\n');
        if trimmed.is_empty() {
            return None;
        }
        Some(format!("<p>{}</p>", trimmed.replace('\n', "</p><p>")))
    }
}
