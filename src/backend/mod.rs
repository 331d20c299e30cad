pub mod deepgram;
pub mod soniox;

use log::{debug, error, info, warn};
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::audio_toolkit::SharedFrames;
use crate::settings::{AppSettings, TranscribeBackendKind};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("credential rejected: {0}")]
    Credential(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One recognition result as every provider's payload is normalized to it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResult {
    pub transcript: String,
    pub is_final: bool,
    pub confidence: f64,
}

/// What a recognition session reports upward. `SessionExpired` is the
/// provider's per-connection time limit, not a failure; the caller opens a
/// fresh session against the same frame stream.
#[derive(Debug)]
pub enum BackendEvent {
    Result(NormalizedResult),
    SessionExpired,
    Closed,
    Failed(BackendError),
}

pub trait TranscribeService: Send {
    fn name(&self) -> &'static str;

    /// Cheap credential check before any audio is captured.
    fn probe(&self) -> Result<(), BackendError>;

    /// Runs one provider session over the shared frame stream. The returned
    /// channel ends with exactly one of SessionExpired, Closed or Failed.
    fn transcribe(&mut self, frames: SharedFrames) -> Receiver<BackendEvent>;
}

pub fn select_service(settings: &AppSettings) -> Box<dyn TranscribeService> {
    match settings.backend {
        TranscribeBackendKind::Soniox => Box::new(soniox::SonioxService::new(settings)),
        TranscribeBackendKind::Deepgram => Box::new(deepgram::DeepgramService::new(settings)),
    }
}

/// How a provider session ended, from the session body's point of view.
pub(crate) enum SessionEnd {
    /// Audio ran out and the server acknowledged the close.
    Completed,
    /// The provider's session limit was reached with audio still flowing.
    Expired,
    Failed(BackendError),
}

/// Spawns the session body on its own thread and translates its outcome into
/// the terminal event on the channel.
pub(crate) fn run_session_thread<F>(name: &'static str, session: F) -> Receiver<BackendEvent>
where
    F: FnOnce(&Sender<BackendEvent>) -> SessionEnd + Send + 'static,
{
    let (tx, rx) = channel();
    let spawned = std::thread::Builder::new()
        .name(format!("{}-session", name))
        .spawn(move || {
            debug!("{} session thread started", name);
            let end = session(&tx);
            match end {
                SessionEnd::Completed => {
                    info!("{} session completed", name);
                    let _ = tx.send(BackendEvent::Closed);
                }
                SessionEnd::Expired => {
                    info!("{} session limit reached, signalling rollover", name);
                    let _ = tx.send(BackendEvent::SessionExpired);
                }
                SessionEnd::Failed(e) => {
                    error!("{} session failed: {}", name, e);
                    let _ = tx.send(BackendEvent::Failed(e));
                }
            }
        });

    if let Err(e) = spawned {
        warn!("Failed to spawn {} session thread: {}", name, e);
        let (fail_tx, fail_rx) = channel();
        let _ = fail_tx.send(BackendEvent::Failed(BackendError::Connect(e.to_string())));
        return fail_rx;
    }

    rx
}

/// Blocking credential probe shared by the providers: a one-shot GET on a
/// throwaway runtime, mapping auth rejections to `Credential`.
pub(crate) fn probe_endpoint(
    name: &'static str,
    url: &str,
    auth_header: &str,
) -> Result<(), BackendError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BackendError::Connect(e.to_string()))?;

    let url = url.to_string();
    let auth = auth_header.to_string();
    runtime.block_on(async move {
        let client = reqwest::Client::new();
        let response = client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Credential(format!(
                "{} rejected the API key ({})",
                name, status
            )));
        }
        if !status.is_success() {
            return Err(BackendError::Connect(format!(
                "{} probe returned {}",
                name, status
            )));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_thread_appends_terminal_event() {
        let rx = run_session_thread("mock", |tx| {
            tx.send(BackendEvent::Result(NormalizedResult {
                transcript: "hello".to_string(),
                is_final: true,
                confidence: 0.9,
            }))
            .unwrap();
            SessionEnd::Completed
        });

        match rx.recv().unwrap() {
            BackendEvent::Result(r) => assert_eq!(r.transcript, "hello"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().unwrap(), BackendEvent::Closed));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn session_thread_reports_expiry() {
        let rx = run_session_thread("mock", |_tx| SessionEnd::Expired);
        assert!(matches!(rx.recv().unwrap(), BackendEvent::SessionExpired));
    }
}
