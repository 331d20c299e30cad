use serde::Serialize;
use std::collections::VecDeque;

/// RMS emissions per second. Independent of the capture frame size.
pub const METER_TICKS_PER_SECOND: u32 = 25;
/// Rolling window the peak reading is taken over.
pub const METER_PEAK_WINDOW_SECS: u32 = 3;

const SILENCE_FLOOR: f32 = 1.0e-5;

/// One sound-meter reading. `rms_db` covers the most recent tick, `peak_db`
/// the rolling window; both in dB full scale, rounded to integers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoudnessSample {
    pub time: f64,
    pub rms_db: i32,
    pub peak_db: i32,
}

/// Derives loudness samples from the resampled capture stream at a fixed
/// emission rate. Driven from the device callback; pure arithmetic, never
/// blocks.
pub struct LoudnessMeter {
    tick_len: usize,
    acc_sum_sq: f64,
    acc_count: usize,
    acc_peak: f32,
    tick_peaks: VecDeque<f32>,
    clock: f64,
}

impl LoudnessMeter {
    pub fn new(sample_rate: u32) -> Self {
        let tick_len = (sample_rate / METER_TICKS_PER_SECOND).max(1) as usize;
        let window_ticks = (METER_TICKS_PER_SECOND * METER_PEAK_WINDOW_SECS) as usize;
        Self {
            tick_len,
            acc_sum_sq: 0.0,
            acc_count: 0,
            acc_peak: 0.0,
            tick_peaks: VecDeque::with_capacity(window_ticks),
            clock: 0.0,
        }
    }

    pub fn push(&mut self, samples: &[f32], emit: &mut impl FnMut(LoudnessSample)) {
        for &s in samples {
            let a = s.abs();
            self.acc_sum_sq += (a as f64) * (a as f64);
            if a > self.acc_peak {
                self.acc_peak = a;
            }
            self.acc_count += 1;

            if self.acc_count == self.tick_len {
                emit(self.complete_tick());
            }
        }
    }

    fn complete_tick(&mut self) -> LoudnessSample {
        let rms = (self.acc_sum_sq / self.acc_count as f64).sqrt() as f32;

        let window_ticks = (METER_TICKS_PER_SECOND * METER_PEAK_WINDOW_SECS) as usize;
        if self.tick_peaks.len() == window_ticks {
            self.tick_peaks.pop_front();
        }
        self.tick_peaks.push_back(self.acc_peak);
        let window_peak = self
            .tick_peaks
            .iter()
            .cloned()
            .fold(0.0f32, f32::max);

        let sample = LoudnessSample {
            time: (self.clock * 100.0).round() / 100.0,
            rms_db: to_db(rms),
            peak_db: to_db(window_peak),
        };

        self.acc_sum_sq = 0.0;
        self.acc_count = 0;
        self.acc_peak = 0.0;
        self.clock += 1.0 / METER_TICKS_PER_SECOND as f64;

        sample
    }
}

fn to_db(amplitude: f32) -> i32 {
    (20.0 * amplitude.max(SILENCE_FLOOR).log10()).round() as i32
}
