use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{
    probe_endpoint, run_session_thread, BackendError, BackendEvent, NormalizedResult, SessionEnd,
    TranscribeService,
};
use crate::audio_toolkit::SharedFrames;
use crate::settings::AppSettings;

const SONIOX_WS_URL: &str = "wss://stt-rt.soniox.com/transcribe-websocket";
const SONIOX_PROBE_URL: &str = "https://api.soniox.com/v1/models";

/// Soniox caps a realtime connection at 60 minutes; roll over before the
/// server forces the issue.
const SESSION_LIMIT: Duration = Duration::from_secs(55 * 60);

pub struct SonioxService {
    api_key: String,
    model: String,
    language: String,
    interim_stability: f64,
    sample_rate: u32,
}

impl SonioxService {
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            api_key: settings.soniox_api_key.clone(),
            model: settings.soniox_model.clone(),
            language: settings.language.clone(),
            interim_stability: settings.soniox_interim_stability,
            sample_rate: settings.target_sample_rate,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            language: self.language.clone(),
            interim_stability: self.interim_stability,
            sample_rate: self.sample_rate,
        }
    }
}

impl TranscribeService for SonioxService {
    fn name(&self) -> &'static str {
        "soniox"
    }

    fn probe(&self) -> Result<(), BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::Credential("Soniox API key is not set".into()));
        }
        probe_endpoint("soniox", SONIOX_PROBE_URL, &format!("Bearer {}", self.api_key))
    }

    fn transcribe(&mut self, frames: SharedFrames) -> Receiver<BackendEvent> {
        let config = self.session_config();
        run_session_thread("soniox", move |tx| {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => return SessionEnd::Failed(BackendError::Connect(e.to_string())),
            };
            runtime.block_on(run_session(config, frames, tx))
        })
    }
}

struct SessionConfig {
    api_key: String,
    model: String,
    language: String,
    interim_stability: f64,
    sample_rate: u32,
}

async fn run_session(
    config: SessionConfig,
    frames: SharedFrames,
    tx: &Sender<BackendEvent>,
) -> SessionEnd {
    let (ws, _) = match connect_async(SONIOX_WS_URL).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Failed(BackendError::Connect(e.to_string())),
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let start = serde_json::json!({
        "api_key": config.api_key,
        "model": config.model,
        "audio_format": "pcm_s16le",
        "sample_rate": config.sample_rate,
        "num_channels": 1,
        "language_hints": [config.language],
    });
    if let Err(e) = ws_tx.send(Message::Text(start.to_string().into())).await {
        return SessionEnd::Failed(BackendError::Connect(e.to_string()));
    }
    debug!("Soniox session configured for model '{}'", config.model);

    // Holding the lock for the whole session keeps the frame stream with one
    // consumer; a rollover session takes it over where this one left off.
    let mut frames = frames.lock().await;

    let deadline = tokio::time::sleep(SESSION_LIMIT);
    tokio::pin!(deadline);

    let mut audio_done = false;
    let mut tokens = TokenAccumulator::new(config.interim_stability);
    let mut results = Vec::new();

    loop {
        tokio::select! {
            frame = frames.recv(), if !audio_done => {
                let send = match frame {
                    Some(frame) => ws_tx.send(Message::Binary(frame.pcm.into())).await,
                    None => {
                        // End-of-audio marker; the server flushes and replies
                        // with finished.
                        audio_done = true;
                        ws_tx.send(Message::Binary(Vec::new().into())).await
                    }
                };
                if let Err(e) = send {
                    return SessionEnd::Failed(BackendError::Connect(e.to_string()));
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response: SonioxResponse = match serde_json::from_str(&text) {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("Unparseable Soniox message: {}", e);
                                continue;
                            }
                        };
                        let finished = match tokens.ingest(response, &mut results) {
                            Ok(finished) => finished,
                            Err(e) => return SessionEnd::Failed(e),
                        };
                        for result in results.drain(..) {
                            let _ = tx.send(BackendEvent::Result(result));
                        }
                        if finished {
                            return if audio_done {
                                SessionEnd::Completed
                            } else {
                                SessionEnd::Expired
                            };
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return if audio_done {
                            SessionEnd::Completed
                        } else {
                            SessionEnd::Expired
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Failed(BackendError::Protocol(e.to_string()));
                    }
                }
            }
            _ = &mut deadline => {
                tokens.flush_final(&mut results);
                for result in results.drain(..) {
                    let _ = tx.send(BackendEvent::Result(result));
                }
                return SessionEnd::Expired;
            }
        }
    }
}

#[derive(Deserialize)]
struct SonioxResponse {
    #[serde(default)]
    tokens: Vec<SonioxToken>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct SonioxToken {
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    confidence: f64,
}

/// Folds Soniox's token stream into utterance-level results. Final tokens
/// accumulate until the `<end>` endpoint marker; non-final tokens below the
/// stability threshold are held back from interim output.
struct TokenAccumulator {
    final_text: String,
    final_confidence_sum: f64,
    final_token_count: usize,
    interim_stability: f64,
}

impl TokenAccumulator {
    fn new(interim_stability: f64) -> Self {
        Self {
            final_text: String::new(),
            final_confidence_sum: 0.0,
            final_token_count: 0,
            interim_stability,
        }
    }

    fn ingest(
        &mut self,
        response: SonioxResponse,
        out: &mut Vec<NormalizedResult>,
    ) -> Result<bool, BackendError> {
        if let Some(code) = response.error_code {
            let message = response.error_message.unwrap_or_default();
            return Err(BackendError::Protocol(format!(
                "Soniox error {}: {}",
                code, message
            )));
        }

        let mut interim = String::new();
        let mut interim_confidence = 1.0f64;

        for token in response.tokens {
            if token.text == "<end>" {
                self.flush_final(out);
            } else if token.is_final {
                self.final_text.push_str(&token.text);
                self.final_confidence_sum += token.confidence;
                self.final_token_count += 1;
            } else if token.confidence >= self.interim_stability {
                interim.push_str(&token.text);
                interim_confidence = interim_confidence.min(token.confidence);
            }
        }

        if !interim.is_empty() || (!self.final_text.is_empty() && !response.finished) {
            out.push(NormalizedResult {
                transcript: format!("{}{}", self.final_text, interim),
                is_final: false,
                confidence: if interim.is_empty() {
                    self.mean_final_confidence()
                } else {
                    interim_confidence
                },
            });
        }

        if response.finished {
            self.flush_final(out);
        }
        Ok(response.finished)
    }

    fn flush_final(&mut self, out: &mut Vec<NormalizedResult>) {
        if self.final_text.trim().is_empty() {
            self.final_text.clear();
            self.final_confidence_sum = 0.0;
            self.final_token_count = 0;
            return;
        }
        out.push(NormalizedResult {
            transcript: std::mem::take(&mut self.final_text),
            is_final: true,
            confidence: self.mean_final_confidence(),
        });
        self.final_confidence_sum = 0.0;
        self.final_token_count = 0;
    }

    fn mean_final_confidence(&self) -> f64 {
        if self.final_token_count == 0 {
            1.0
        } else {
            self.final_confidence_sum / self.final_token_count as f64
        }
    }
}
