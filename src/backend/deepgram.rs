use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{
    probe_endpoint, run_session_thread, BackendError, BackendEvent, NormalizedResult, SessionEnd,
    TranscribeService,
};
use crate::audio_toolkit::SharedFrames;
use crate::settings::AppSettings;

const DEEPGRAM_WS_URL: &str = "wss://api.deepgram.com/v1/listen";
const DEEPGRAM_PROBE_URL: &str = "https://api.deepgram.com/v1/auth/token";

/// Deepgram connections are renewed proactively rather than waiting for the
/// server to drop a long-lived stream.
const SESSION_LIMIT: Duration = Duration::from_secs(30 * 60);

pub struct DeepgramService {
    api_key: String,
    model: String,
    language: String,
    interim_stability: f64,
    sample_rate: u32,
}

impl DeepgramService {
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            api_key: settings.deepgram_api_key.clone(),
            model: settings.deepgram_model.clone(),
            language: settings.language.clone(),
            interim_stability: settings.deepgram_interim_stability,
            sample_rate: settings.target_sample_rate,
        }
    }

    fn listen_url(&self) -> String {
        format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate={}&channels=1&interim_results=true&punctuate=true",
            DEEPGRAM_WS_URL, self.model, self.language, self.sample_rate
        )
    }
}

impl TranscribeService for DeepgramService {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn probe(&self) -> Result<(), BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::Credential(
                "Deepgram API key is not set".into(),
            ));
        }
        probe_endpoint(
            "deepgram",
            DEEPGRAM_PROBE_URL,
            &format!("Token {}", self.api_key),
        )
    }

    fn transcribe(&mut self, frames: SharedFrames) -> Receiver<BackendEvent> {
        let url = self.listen_url();
        let api_key = self.api_key.clone();
        let interim_stability = self.interim_stability;
        run_session_thread("deepgram", move |tx| {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => return SessionEnd::Failed(BackendError::Connect(e.to_string())),
            };
            runtime.block_on(run_session(url, api_key, interim_stability, frames, tx))
        })
    }
}

async fn run_session(
    url: String,
    api_key: String,
    interim_stability: f64,
    frames: SharedFrames,
    tx: &Sender<BackendEvent>,
) -> SessionEnd {
    let mut request = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => return SessionEnd::Failed(BackendError::Connect(e.to_string())),
    };
    let auth = match HeaderValue::from_str(&format!("Token {}", api_key)) {
        Ok(v) => v,
        Err(e) => return SessionEnd::Failed(BackendError::Credential(e.to_string())),
    };
    request.headers_mut().insert(AUTHORIZATION, auth);

    let (ws, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Failed(BackendError::Connect(e.to_string())),
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    debug!("Deepgram session open");

    let mut frames = frames.lock().await;

    let deadline = tokio::time::sleep(SESSION_LIMIT);
    tokio::pin!(deadline);

    let mut audio_done = false;

    loop {
        tokio::select! {
            frame = frames.recv(), if !audio_done => {
                let send = match frame {
                    Some(frame) => ws_tx.send(Message::Binary(frame.pcm.into())).await,
                    None => {
                        audio_done = true;
                        ws_tx
                            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                            .await
                    }
                };
                if let Err(e) = send {
                    return SessionEnd::Failed(BackendError::Connect(e.to_string()));
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match normalize_message(&text, interim_stability) {
                            Ok(Some(result)) => {
                                let _ = tx.send(BackendEvent::Result(result));
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Unparseable Deepgram message: {}", e),
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
                return SessionEnd::Expired;
            }
        }
    }
}

#[derive(Deserialize)]
struct ListenMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<Channel>,
}

#[derive(Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
}

/// Picks the top alternative out of a Results message. Interim results below
/// the stability threshold and empty transcripts are dropped.
fn normalize_message(
    text: &str,
    interim_stability: f64,
) -> Result<Option<NormalizedResult>, serde_json::Error> {
    let message: ListenMessage = serde_json::from_str(text)?;
    if message.kind != "Results" {
        return Ok(None);
    }
    let alternative = match message.channel.and_then(|c| c.alternatives.into_iter().next()) {
        Some(a) => a,
        None => return Ok(None),
    };
    if alternative.transcript.trim().is_empty() {
        return Ok(None);
    }
    if !message.is_final && alternative.confidence < interim_stability {
        return Ok(None);
    }
    Ok(Some(NormalizedResult {
        transcript: alternative.transcript,
        is_final: message.is_final,
        confidence: alternative.confidence,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_message_is_normalized() {
        let result = normalize_message(
            r#"{"type":"Results","is_final":true,
                "channel":{"alternatives":[{"transcript":"good morning","confidence":0.97}]}}"#,
            0.8,
        )
        .unwrap()
        .unwrap();

        assert_eq!(result.transcript, "good morning");
        assert!(result.is_final);
        assert!((result.confidence - 0.97).abs() < 1e-9);
    }

    #[test]
    fn unstable_interim_is_dropped() {
        let result = normalize_message(
            r#"{"type":"Results","is_final":false,
                "channel":{"alternatives":[{"transcript":"good mor","confidence":0.4}]}}"#,
            0.8,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn metadata_and_empty_transcripts_are_ignored() {
        assert!(normalize_message(r#"{"type":"Metadata"}"#, 0.8)
            .unwrap()
            .is_none());
        assert!(normalize_message(
            r#"{"type":"Results","is_final":true,
                "channel":{"alternatives":[{"transcript":"  ","confidence":0.9}]}}"#,
            0.8,
        )
        .unwrap()
        .is_none());
    }
}
