pub mod audio;
pub mod meter;

pub use audio::device::{list_input_devices, select_input_device, CpalDeviceInfo, DeviceError};
pub use audio::source::{MicrophoneSource, SourceConfig};
pub use audio::{AudioFrame, CaptureSource, SharedFrames};
pub use meter::{LoudnessMeter, LoudnessSample};
