#[cfg(test)]
mod audio_test;

use portable_atomic::AtomicF64;
use std::sync::atomic::Ordering;
use util::sync::Mutex;

const SILENT_AUDIO_LEVEL: u8 = 127;
const NEG_INV_20: f64 = -1.0 / 20.0;

#[derive(Debug, Clone, Copy)]
pub struct AudioLevelParams {
    /// Levels at or below this are active; dBov, lower is louder.
    pub active_level: u8,
    /// Minimum percentage of the observe window that must be active.
    pub min_percentile: u8,
    /// Window length in milliseconds.
    pub observe_duration: u32,
    /// EMA window; same centre of mass as an SMA over this many intervals.
    pub smooth_intervals: u32,
}

impl Default for AudioLevelParams {
    fn default() -> Self {
        AudioLevelParams {
            active_level: 35,
            min_percentile: 40,
            observe_duration: 400,
            smooth_intervals: 2,
        }
    }
}

/// AudioLevel tracks the loudness of one audio track over fixed observation
/// windows, producing a smoothed linear level gated by an activity
/// percentile.
pub struct AudioLevel {
    params: AudioLevelParams,
    /// shortest duration within an observe window to be considered active
    min_active_duration: u32,
    smooth_factor: f64,
    active_threshold: f64,

    smoothed_level: AtomicF64,
    window: Mutex<Window>,
}

#[derive(Default)]
struct Window {
    loudest_observed_level: u8,
    active_duration: u32,
    observed_duration: u32,
}

impl AudioLevel {
    pub fn new(params: AudioLevelParams) -> Self {
        let mut smooth_factor = 1.0;
        if params.smooth_intervals > 0 {
            smooth_factor = 2.0 / (params.smooth_intervals as f64 + 1.0);
        }

        AudioLevel {
            min_active_duration: params.min_percentile as u32 * params.observe_duration / 100,
            smooth_factor,
            active_threshold: convert_audio_level(params.active_level as f64),
            smoothed_level: AtomicF64::new(0.0),
            window: Mutex::new(Window {
                loudest_observed_level: SILENT_AUDIO_LEVEL,
                ..Default::default()
            }),
            params,
        }
    }

    /// Observes one frame worth of audio.
    pub fn observe(&self, level: u8, duration_ms: u32) {
        let mut window = self.window.lock();

        window.observed_duration += duration_ms;

        if level <= self.params.active_level {
            window.active_duration += duration_ms;
            if window.loudest_observed_level > level {
                window.loudest_observed_level = level;
            }
        }

        if window.observed_duration >= self.params.observe_duration {
            if window.active_duration >= self.min_active_duration {
                // weight the loudest level by how much of the window was
                // active: 0 when fully active, negative when partially
                let activity_weight = 20.0
                    * (window.active_duration as f64 / self.params.observe_duration as f64).log10();
                let adjusted_level = window.loudest_observed_level as f64 - activity_weight;
                let linear_level = convert_audio_level(adjusted_level);

                // exponential smoothing to dampen transients
                let smoothed = self.smoothed_level.load(Ordering::Relaxed);
                self.smoothed_level.store(
                    smoothed + (linear_level - smoothed) * self.smooth_factor,
                    Ordering::Relaxed,
                );
            } else {
                self.smoothed_level.store(0.0, Ordering::Relaxed);
            }

            window.loudest_observed_level = SILENT_AUDIO_LEVEL;
            window.active_duration = 0;
            window.observed_duration = 0;
        }
    }

    /// Returns the current smoothed level and whether it crosses the active
    /// threshold.
    pub fn get_level(&self) -> (f64, bool) {
        let smoothed = self.smoothed_level.load(Ordering::Relaxed);
        (smoothed, smoothed >= self.active_threshold)
    }
}

/// Converts a dBov level to linear.
pub fn convert_audio_level(level: f64) -> f64 {
    10f64.powf(level * NEG_INV_20)
}
