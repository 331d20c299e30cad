use thiserror::Error;

use crate::audio_toolkit::DeviceError;
use crate::backend::BackendError;

/// Fatal conditions observed by the transcription session engine.
///
/// Every variant ends the same way for listeners: a synthetic offline
/// status event on the broadcast layer. The taxonomy exists for logs and
/// for the supervisor, not for viewers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input device unavailable: {0}")]
    Device(#[from] DeviceError),

    #[error("transcription backend unusable: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
