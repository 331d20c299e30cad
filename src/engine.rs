use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::audio_toolkit::{CaptureSource, MicrophoneSource, SourceConfig};
use crate::backend::{select_service, BackendEvent, NormalizedResult, TranscribeService};
use crate::broadcast::{BroadcastMessage, Finality, QueueManager};
use crate::error::EngineError;
use crate::logging::LogTap;
use crate::settings::{write_settings, AppSettings};
use crate::transcript::TranscriptStore;

const ONLINE_STATUS: &str = "Transcription engine is online";
const OFFLINE_STATUS: &str = "Transcription engine is offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Offline,
    Starting,
    Online,
    Stopping,
}

/// State shared between the public handle and the run thread.
struct EngineShared {
    settings: Mutex<AppSettings>,
    settings_path: PathBuf,
    queues: Arc<QueueManager>,
    store: Arc<TranscriptStore>,
    phase: Mutex<Phase>,
    source: Mutex<Option<Arc<dyn CaptureSource>>>,
    stop_requested: AtomicBool,
}

/// The capture-to-broadcast pipeline: owns the microphone, drives provider
/// sessions over its frame stream, and feeds recognized text through the
/// censor into the transcript category and the session transcript file.
pub struct TranscribeEngine {
    shared: Arc<EngineShared>,
    run_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TranscribeEngine {
    pub fn new(settings_path: PathBuf, settings: AppSettings, tap: LogTap) -> Self {
        let store = Arc::new(TranscriptStore::new());
        let queues = Arc::new(QueueManager::new(tap, store.clone()));
        TranscribeEngine {
            shared: Arc::new(EngineShared {
                settings: Mutex::new(settings),
                settings_path,
                queues,
                store,
                phase: Mutex::new(Phase::Offline),
                source: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
            }),
            run_thread: Mutex::new(None),
        }
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.shared.queues.clone()
    }

    pub fn is_online(&self) -> bool {
        *self.shared.phase.lock().unwrap() == Phase::Online
    }

    /// Brings the engine online with the configured microphone and backend.
    /// A second start while not offline is ignored.
    pub fn start(&self) {
        self.launch(None);
    }

    /// Same lifecycle with an injected capture source and recognition
    /// service. Used by supervisors and tests that provide their own.
    pub fn start_with(&self, source: Arc<dyn CaptureSource>, service: Box<dyn TranscribeService>) {
        self.launch(Some((source, service)));
    }

    fn launch(&self, injected: Option<(Arc<dyn CaptureSource>, Box<dyn TranscribeService>)>) {
        {
            let mut phase = self.shared.phase.lock().unwrap();
            if *phase != Phase::Offline {
                warn!("Start requested while engine is not offline, ignoring");
                return;
            }
            *phase = Phase::Starting;
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("transcribe-engine".to_string())
            .spawn(move || run(shared, injected));

        match handle {
            Ok(handle) => {
                *self.run_thread.lock().unwrap() = Some(handle);
            }
            Err(e) => {
                error!("Failed to spawn engine thread: {}", e);
                *self.shared.phase.lock().unwrap() = Phase::Offline;
            }
        }
    }

    /// Takes the engine offline: stops capture, lets the provider session
    /// drain, and waits for the run thread.
    pub fn stop(&self) {
        {
            let mut phase = self.shared.phase.lock().unwrap();
            if *phase == Phase::Offline || *phase == Phase::Stopping {
                return;
            }
            *phase = Phase::Stopping;
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let source = self.shared.source.lock().unwrap().clone();
        if let Some(source) = source {
            source.close();
        }

        if let Some(handle) = self.run_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Stops the engine and closes every listener.
    pub fn shutdown(&self) {
        self.stop();
        self.shared.queues.shutdown();
    }
}

fn run(
    shared: Arc<EngineShared>,
    injected: Option<(Arc<dyn CaptureSource>, Box<dyn TranscribeService>)>,
) {
    let settings = shared.settings.lock().unwrap().clone();

    let (source, mut service) = match injected {
        Some(pair) => pair,
        None => match open_capture(&shared, &settings) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Engine start failed: {}", e);
                go_offline(&shared);
                return;
            }
        },
    };

    shared.source.lock().unwrap().replace(source.clone());
    // A stop that raced the startup closes the source here instead.
    if shared.stop_requested.load(Ordering::SeqCst) {
        source.close();
    }

    let transcript_path = session_transcript_path(&settings);
    if let Err(e) = shared.store.open_session(&transcript_path) {
        error!("Could not open transcript {:?}: {}", transcript_path, e);
    }

    if try_go_online(&shared) {
        info!("{}", ONLINE_STATUS);
        shared.queues.publish_transcript(BroadcastMessage::Status {
            record: ONLINE_STATUS.to_string(),
        });
    }

    let censor = if settings.enable_censorship {
        Some(CensorFilter::new(&settings.censored_words))
    } else {
        None
    };

    let frames = source.frames();
    'sessions: loop {
        let events = service.transcribe(frames.clone());
        loop {
            match events.recv() {
                Ok(BackendEvent::Result(result)) => {
                    process_result(&shared, &settings, censor.as_ref(), result);
                }
                Ok(BackendEvent::SessionExpired) => {
                    debug!("Provider session rolled over");
                    continue 'sessions;
                }
                Ok(BackendEvent::Closed) => break 'sessions,
                Ok(BackendEvent::Failed(e)) => {
                    error!("Recognition failed: {}", e);
                    break 'sessions;
                }
                Err(_) => break 'sessions,
            }
        }
    }

    source.close();
    shared.source.lock().unwrap().take();
    shared.store.close_session();
    go_offline(&shared);
}

/// The Starting -> Online transition. Refused when a stop has already been
/// requested (or the phase moved on), so a preempted startup winds down
/// without ever reading as online.
fn try_go_online(shared: &EngineShared) -> bool {
    let mut phase = shared.phase.lock().unwrap();
    if shared.stop_requested.load(Ordering::SeqCst) || *phase != Phase::Starting {
        return false;
    }
    *phase = Phase::Online;
    true
}

fn go_offline(shared: &EngineShared) {
    *shared.phase.lock().unwrap() = Phase::Offline;
    info!("{}", OFFLINE_STATUS);
    shared.queues.publish_transcript(BroadcastMessage::Status {
        record: OFFLINE_STATUS.to_string(),
    });
}

fn open_capture(
    shared: &EngineShared,
    settings: &AppSettings,
) -> Result<(Arc<dyn CaptureSource>, Box<dyn TranscribeService>), EngineError> {
    let recording_path = if settings.save_recordings {
        std::fs::create_dir_all(&settings.recordings_folder)?;
        Some(
            settings
                .recordings_folder
                .join(format!("Recording-{}.wav", session_stamp())),
        )
    } else {
        None
    };

    let source = MicrophoneSource::open(SourceConfig {
        device_name: settings.input_device.clone(),
        target_sample_rate: settings.target_sample_rate,
        recording_path,
        meter_tx: shared.queues.meter_sender(),
    })?;

    if source.fell_back() {
        warn!(
            "Configured input device unavailable, using '{}'",
            source.device_name()
        );
        let mut updated = shared.settings.lock().unwrap();
        updated.input_device = Some(source.device_name().to_string());
        if let Err(e) = write_settings(&shared.settings_path, &updated) {
            warn!("Could not persist input device fallback: {}", e);
        }
    }

    let service = select_service(settings);
    if let Err(e) = service.probe() {
        source.close();
        return Err(e.into());
    }
    info!("Using {} recognition backend", service.name());

    Ok((Arc::new(source), service))
}

fn session_stamp() -> String {
    Local::now().format("%Y-%m-%d-%H%M").to_string()
}

fn session_transcript_path(settings: &AppSettings) -> PathBuf {
    settings
        .transcripts_folder
        .join(format!("Transcript-{}.txt", session_stamp()))
}

fn process_result(
    shared: &EngineShared,
    settings: &AppSettings,
    censor: Option<&CensorFilter>,
    result: NormalizedResult,
) {
    if !result.is_final && !settings.show_interim_results {
        return;
    }

    let text = match censor {
        Some(filter) => filter.apply(&result.transcript),
        None => result.transcript,
    };

    let time = Utc::now().timestamp_millis() as f64 / 1000.0;
    shared.queues.publish_transcript(BroadcastMessage::Transcript {
        finality: if result.is_final {
            Finality::Final
        } else {
            Finality::Interim
        },
        record: text.clone(),
        time,
    });

    if result.is_final {
        if let Err(e) = shared.store.append_final(&text) {
            error!("Could not append to transcript: {}", e);
        }
    }
}

/// Masks configured words down to their first letter. Matching is
/// case-insensitive on whole words only; the mask keeps the original first
/// letter so capitalization survives.
pub struct CensorFilter {
    rules: Vec<(Regex, String)>,
}

impl CensorFilter {
    pub fn new(words: &[String]) -> Self {
        let mut rules = Vec::new();
        for word in words {
            let mut chars = word.chars();
            let first = match chars.next() {
                Some(c) => c,
                None => continue,
            };
            let rest: String = chars.collect();
            if rest.is_empty() {
                continue;
            }
            let pattern = format!(
                r"(?i)\b({}){}\b",
                regex::escape(&first.to_string()),
                regex::escape(&rest)
            );
            match Regex::new(&pattern) {
                Ok(re) => {
                    let mask = format!("${{1}}{}", "*".repeat(rest.chars().count()));
                    rules.push((re, mask));
                }
                Err(e) => warn!("Skipping unusable censored word '{}': {}", word, e),
            }
        }
        CensorFilter { rules }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut output = text.to_string();
        for (re, mask) in &self.rules {
            output = re.replace_all(&output, mask.as_str()).into_owned();
        }
        output
    }
}
