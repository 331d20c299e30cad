pub mod device;
pub mod resampler;
pub mod source;

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// One fixed-duration chunk of little-endian 16-bit mono PCM at the target
/// sample rate, tagged with its position in the capture stream. Owned by
/// whoever dequeues it; the capture side keeps nothing after handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u64,
    pub pcm: Vec<u8>,
}

/// The capture stream as the backend adapters consume it. The receiver is
/// shared behind an async mutex so a provider session can be torn down and a
/// fresh one handed the same, still-running audio stream.
pub type SharedFrames = Arc<tokio::sync::Mutex<UnboundedReceiver<AudioFrame>>>;

/// An opened capture device as the engine sees it. Closing is idempotent and
/// ends the frame stream (the channel disconnecting is the end-of-stream
/// sentinel consumers observe).
pub trait CaptureSource: Send + Sync {
    fn device_name(&self) -> &str;
    fn frames(&self) -> SharedFrames;
    fn close(&self);
}
