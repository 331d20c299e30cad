use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use super::device::{negotiate_capture_config, select_input_device, DeviceError};
use super::resampler::{downmix_into, FrameResampler};
use super::{AudioFrame, CaptureSource, SharedFrames};
use crate::audio_toolkit::meter::{LoudnessMeter, LoudnessSample};

/// Frames handed downstream are 100 ms of target-rate audio.
const FRAME_DURATION: Duration = Duration::from_millis(100);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SourceConfig {
    pub device_name: Option<String>,
    pub target_sample_rate: u32,
    /// When set, a copy of the capture is written here as 16-bit WAV.
    pub recording_path: Option<PathBuf>,
    /// Loudness intake of the broadcast layer's meter category.
    pub meter_tx: Sender<Option<LoudnessSample>>,
}

/// The live input device: a cpal stream whose driver callback resamples,
/// meters and frames the capture without ever blocking, feeding one
/// unbounded frame channel with exactly one real consumer.
///
/// The cpal stream is owned by a dedicated thread (it is not `Send`); open
/// blocks only until that thread reports the stream running.
pub struct MicrophoneSource {
    name: String,
    fell_back: bool,
    frames: SharedFrames,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MicrophoneSource {
    pub fn open(config: SourceConfig) -> Result<Self, DeviceError> {
        let (frames_tx, frames_rx) = unbounded_channel();
        let (report_tx, report_rx) = channel::<Result<OpenReport, DeviceError>>();
        let stop = Arc::new(AtomicBool::new(false));

        let (rec_tx, rec_rx) = if config.recording_path.is_some() {
            let (tx, rx) = channel::<Vec<i16>>();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let thread_config = config_for_thread(&config);
        let mut threads = Vec::new();

        let stop_flag = stop.clone();
        let capture = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(thread_config, frames_tx, rec_tx, report_tx, stop_flag))
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        threads.push(capture);

        let report = report_rx
            .recv()
            .map_err(|_| DeviceError::Stream("capture thread exited before opening".into()))??;

        if let (Some(rx), Some(path)) = (rec_rx, config.recording_path) {
            let rate = config.target_sample_rate;
            let writer = std::thread::Builder::new()
                .name("audio-recording".to_string())
                .spawn(move || recording_thread(path, rate, rx))
                .map_err(|e| DeviceError::Stream(e.to_string()))?;
            threads.push(writer);
        }

        info!(
            "Microphone '{}' open, capturing at {} Hz",
            report.name, report.capture_rate
        );

        Ok(MicrophoneSource {
            name: report.name,
            fell_back: report.fell_back,
            frames: Arc::new(tokio::sync::Mutex::new(frames_rx)),
            stop,
            threads: Mutex::new(threads),
        })
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back
    }
}

impl CaptureSource for MicrophoneSource {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn frames(&self) -> SharedFrames {
        self.frames.clone()
    }

    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Microphone '{}' closed", self.name);
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct OpenReport {
    name: String,
    fell_back: bool,
    capture_rate: u32,
}

/// The slice of `SourceConfig` the capture thread needs (the recording path
/// stays with the writer thread).
struct ThreadConfig {
    device_name: Option<String>,
    target_sample_rate: u32,
    meter_tx: Sender<Option<LoudnessSample>>,
}

fn config_for_thread(config: &SourceConfig) -> ThreadConfig {
    ThreadConfig {
        device_name: config.device_name.clone(),
        target_sample_rate: config.target_sample_rate,
        meter_tx: config.meter_tx.clone(),
    }
}

fn capture_thread(
    config: ThreadConfig,
    frames_tx: UnboundedSender<AudioFrame>,
    rec_tx: Option<Sender<Vec<i16>>>,
    report_tx: Sender<Result<OpenReport, DeviceError>>,
    stop: Arc<AtomicBool>,
) {
    let (stream, ctx) = match open_stream(&config, frames_tx, rec_tx) {
        Ok((stream, ctx, report)) => {
            let _ = report_tx.send(Ok(report));
            (stream, ctx)
        }
        Err(e) => {
            let _ = report_tx.send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(STOP_POLL_INTERVAL);
    }

    // Dropping the stream stops the callback; flushing then emits the
    // buffered tail as one final padded frame before the frame sender is
    // dropped (the disconnect is the end-of-stream sentinel downstream).
    drop(stream);
    if let Ok(mut ctx) = ctx.lock() {
        ctx.finish();
    }
    debug!("Capture thread exiting");
}

type SharedCtx = Arc<Mutex<CaptureCtx>>;

fn open_stream(
    config: &ThreadConfig,
    frames_tx: UnboundedSender<AudioFrame>,
    rec_tx: Option<Sender<Vec<i16>>>,
) -> Result<(cpal::Stream, SharedCtx, OpenReport), DeviceError> {
    let selected = select_input_device(config.device_name.as_deref())?;
    let capture = negotiate_capture_config(&selected.device, config.target_sample_rate)?;

    let resampler = FrameResampler::new(
        capture.capture_rate,
        config.target_sample_rate,
        FRAME_DURATION,
    )?;

    let ctx = Arc::new(Mutex::new(CaptureCtx {
        interleaved: Vec::new(),
        mono: Vec::new(),
        resampler,
        meter: LoudnessMeter::new(config.target_sample_rate),
        meter_tx: config.meter_tx.clone(),
        frames_tx,
        rec_tx,
        seq: 0,
    }));

    let stream = match capture.sample_format {
        SampleFormat::F32 => build_stream::<f32>(&selected.device, &capture.stream, ctx.clone())?,
        SampleFormat::I16 => build_stream::<i16>(&selected.device, &capture.stream, ctx.clone())?,
        SampleFormat::U16 => build_stream::<u16>(&selected.device, &capture.stream, ctx.clone())?,
        other => {
            return Err(DeviceError::Configure(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    Ok((
        stream,
        ctx,
        OpenReport {
            name: selected.name,
            fell_back: selected.fell_back,
            capture_rate: capture.capture_rate,
        },
    ))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ctx: SharedCtx,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Uncontended except at teardown, after the stream is gone.
                if let Ok(mut ctx) = ctx.lock() {
                    ctx.consume(data, channels);
                }
            },
            move |err| {
                error!("Input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| DeviceError::Stream(e.to_string()))
}

/// All state the driver callback touches. Everything is push-and-return;
/// the callback never blocks.
struct CaptureCtx {
    interleaved: Vec<f32>,
    mono: Vec<f32>,
    resampler: FrameResampler,
    meter: LoudnessMeter,
    meter_tx: Sender<Option<LoudnessSample>>,
    frames_tx: UnboundedSender<AudioFrame>,
    rec_tx: Option<Sender<Vec<i16>>>,
    seq: u64,
}

impl CaptureCtx {
    fn consume<T>(&mut self, data: &[T], channels: usize)
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        self.interleaved.clear();
        self.interleaved
            .extend(data.iter().map(|&s| f32::from_sample(s)));

        let mut mono = std::mem::take(&mut self.mono);
        mono.clear();
        downmix_into(&mut mono, &self.interleaved, channels);

        let meter = &mut self.meter;
        let meter_tx = &self.meter_tx;
        let frames_tx = &self.frames_tx;
        let rec_tx = &self.rec_tx;
        let seq = &mut self.seq;

        self.resampler.push(&mono, &mut |frame: &[f32]| {
            emit_frame(frame, meter, meter_tx, frames_tx, rec_tx, seq);
        });

        self.mono = mono;
    }

    /// Drains the resampler's buffered tail, emitting the final partial
    /// frame padded with silence. Called once, after the stream is gone.
    fn finish(&mut self) {
        let meter = &mut self.meter;
        let meter_tx = &self.meter_tx;
        let frames_tx = &self.frames_tx;
        let rec_tx = &self.rec_tx;
        let seq = &mut self.seq;

        self.resampler.finish(&mut |frame: &[f32]| {
            emit_frame(frame, meter, meter_tx, frames_tx, rec_tx, seq);
        });
    }
}

fn emit_frame(
    frame: &[f32],
    meter: &mut LoudnessMeter,
    meter_tx: &Sender<Option<LoudnessSample>>,
    frames_tx: &UnboundedSender<AudioFrame>,
    rec_tx: &Option<Sender<Vec<i16>>>,
    seq: &mut u64,
) {
    meter.push(frame, &mut |sample| {
        let _ = meter_tx.send(Some(sample));
    });

    let pcm_i16: Vec<i16> = frame
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();

    if let Some(tx) = rec_tx {
        let _ = tx.send(pcm_i16.clone());
    }

    let mut pcm = Vec::with_capacity(pcm_i16.len() * 2);
    for s in &pcm_i16 {
        pcm.extend_from_slice(&s.to_le_bytes());
    }

    *seq += 1;
    let _ = frames_tx.send(AudioFrame { seq: *seq, pcm });
}

fn recording_thread(path: PathBuf, sample_rate: u32, rx: Receiver<Vec<i16>>) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = match hound::WavWriter::create(&path, spec) {
        Ok(w) => w,
        Err(e) => {
            warn!("Failed to create recording {:?}: {}", path, e);
            // Drain so the capture side never sees a closed channel mid-session.
            while rx.recv().is_ok() {}
            return;
        }
    };

    while let Ok(samples) = rx.recv() {
        for s in samples {
            if writer.write_sample(s).is_err() {
                warn!("Recording write failed, dropping remainder");
                while rx.recv().is_ok() {}
                break;
            }
        }
    }

    match writer.finalize() {
        Ok(()) => info!("Recording saved: {:?}", path),
        Err(e) => warn!("Failed to finalize recording {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn test_ctx(
        rate: u32,
    ) -> (
        CaptureCtx,
        UnboundedReceiver<AudioFrame>,
        Receiver<Option<LoudnessSample>>,
    ) {
        let (frames_tx, frames_rx) = unbounded_channel();
        let (meter_tx, meter_rx) = channel();
        let ctx = CaptureCtx {
            interleaved: Vec::new(),
            mono: Vec::new(),
            resampler: FrameResampler::new(rate, rate, FRAME_DURATION).unwrap(),
            meter: LoudnessMeter::new(rate),
            meter_tx,
            frames_tx,
            rec_tx: None,
            seq: 0,
        };
        (ctx, frames_rx, meter_rx)
    }

    #[test]
    fn stereo_input_is_downmixed_and_framed() {
        // 100 ms at 16 kHz -> 1600-sample frames, 3200 bytes of s16le.
        let (mut ctx, mut frames, _meter) = test_ctx(16000);

        let data: Vec<f32> = std::iter::repeat([1.0f32, 0.0])
            .take(1600)
            .flatten()
            .collect();
        ctx.consume(&data, 2);

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.seq, 1);
        assert_eq!(frame.pcm.len(), 3200);
        let first = i16::from_le_bytes([frame.pcm[0], frame.pcm[1]]);
        assert_eq!(first, (0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn finish_flushes_partial_tail_frame() {
        let (mut ctx, mut frames, _meter) = test_ctx(16000);

        ctx.consume(&vec![0.25f32; 100], 1);
        assert!(frames.try_recv().is_err());

        ctx.finish();
        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.pcm.len(), 3200);
        let first = i16::from_le_bytes([frame.pcm[0], frame.pcm[1]]);
        assert_eq!(first, (0.25 * i16::MAX as f32) as i16);
        // Padding past the buffered samples is silence.
        let padded = i16::from_le_bytes([frame.pcm[300], frame.pcm[301]]);
        assert_eq!(padded, 0);
    }
}
