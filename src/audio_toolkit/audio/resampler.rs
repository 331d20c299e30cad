use rubato::{FftFixedIn, Resampler};
use std::time::Duration;

use super::device::DeviceError;

// Input chunk fed to rubato per process() call.
const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Converts a stream of mono samples at the capture rate into fixed-duration
/// frames at the target rate. When the rates already match, it only reframes.
///
/// Built once per capture stream and driven entirely from the device
/// callback, so nothing here may block or allocate unboundedly.
pub struct FrameResampler {
    inner: Option<FftFixedIn<f32>>,
    staging: Vec<f32>,
    frame_len: usize,
    carry: Vec<f32>,
}

impl FrameResampler {
    pub fn new(in_hz: u32, out_hz: u32, frame_dur: Duration) -> Result<Self, DeviceError> {
        let frame_len = (out_hz as f64 * frame_dur.as_secs_f64()).round() as usize;
        debug_assert!(frame_len > 0, "frame duration too short");

        let inner = if in_hz == out_hz {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(in_hz as usize, out_hz as usize, RESAMPLER_CHUNK_SIZE, 1, 1)
                    .map_err(|e| DeviceError::Resampler(e.to_string()))?,
            )
        };

        Ok(Self {
            inner,
            staging: Vec::with_capacity(RESAMPLER_CHUNK_SIZE),
            frame_len,
            carry: Vec::with_capacity(frame_len),
        })
    }

    /// Feed mono capture samples; `sink` is called once per completed frame
    /// of exactly `frame_len` target-rate samples.
    pub fn push(&mut self, mut src: &[f32], sink: &mut impl FnMut(&[f32])) {
        if self.inner.is_none() {
            self.reframe(src, sink);
            return;
        }

        while !src.is_empty() {
            let space = RESAMPLER_CHUNK_SIZE - self.staging.len();
            let take = space.min(src.len());
            self.staging.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.staging.len() == RESAMPLER_CHUNK_SIZE {
                let resampler = self.inner.as_mut().unwrap();
                if let Ok(out) = resampler.process(&[&self.staging[..]], None) {
                    self.reframe(&out[0], sink);
                }
                self.staging.clear();
            }
        }
    }

    /// Drain buffered input, padding the tail with silence so the final
    /// partial frame is still emitted.
    pub fn finish(&mut self, sink: &mut impl FnMut(&[f32])) {
        if let Some(resampler) = self.inner.as_mut() {
            if !self.staging.is_empty() {
                self.staging.resize(RESAMPLER_CHUNK_SIZE, 0.0);
                if let Ok(out) = resampler.process(&[&self.staging[..]], None) {
                    let frames = out[0].clone();
                    self.reframe(&frames, sink);
                }
                self.staging.clear();
            }
        }

        if !self.carry.is_empty() {
            self.carry.resize(self.frame_len, 0.0);
            sink(&self.carry);
            self.carry.clear();
        }
    }

    fn reframe(&mut self, mut data: &[f32], sink: &mut impl FnMut(&[f32])) {
        while !data.is_empty() {
            let space = self.frame_len - self.carry.len();
            let take = space.min(data.len());
            self.carry.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.carry.len() == self.frame_len {
                sink(&self.carry);
                self.carry.clear();
            }
        }
    }
}

/// Average interleaved channels down to mono, appending to `dst`.
pub fn downmix_into(dst: &mut Vec<f32>, interleaved: &[f32], channels: usize) {
    if channels <= 1 {
        dst.extend_from_slice(interleaved);
        return;
    }
    for chunk in interleaved.chunks_exact(channels) {
        dst.push(chunk.iter().sum::<f32>() / channels as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reframe_without_rate_change() {
        // 100 ms at 1 kHz -> 100-sample frames
        let mut rs = FrameResampler::new(1000, 1000, Duration::from_millis(100)).unwrap();
        let mut frames: Vec<Vec<f32>> = Vec::new();

        rs.push(&[0.5; 250], &mut |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 100));

        rs.finish(&mut |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 3);
        // tail frame is the 50 leftover samples padded with silence
        assert_eq!(frames[2][49], 0.5);
        assert_eq!(frames[2][50], 0.0);
    }

    #[test]
    fn test_resampled_output_rate() {
        let mut rs = FrameResampler::new(48000, 16000, Duration::from_millis(100)).unwrap();
        let mut emitted = 0usize;

        // 1 second of input should produce ~1 second of 16 kHz frames
        // (rubato holds some internal delay, so allow one frame of slack).
        let input = vec![0.0f32; 48000];
        rs.push(&input, &mut |f| emitted += f.len());
        rs.finish(&mut |f| emitted += f.len());

        assert!(emitted >= 16000 - 1600 && emitted <= 16000 + 3200, "emitted {}", emitted);
    }

    #[test]
    fn test_downmix_stereo() {
        let mut out = Vec::new();
        downmix_into(&mut out, &[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(out, vec![0.5, 0.5]);
    }
}
