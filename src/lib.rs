pub mod audio_toolkit;
pub mod backend;
pub mod broadcast;
pub mod engine;
pub mod error;
pub mod logging;
pub mod settings;
pub mod transcript;

pub use engine::TranscribeEngine;
pub use error::EngineError;
