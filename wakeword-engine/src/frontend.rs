/// DSP frontend: PCM windows to filterbank energies
///
/// The engine treats the frontend as an opaque transform. `FilterbankFrontend`
/// is the bundled implementation: a sliding Hann-windowed FFT followed by a
/// triangular mel filterbank and log compression.

use crate::audio_buffer::AudioSample;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("Invalid frontend settings: {0}")]
    InvalidSettings(String),
}

/// Parameters the frontend is configured with at initialization
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendSettings {
    pub sample_rate: usize,
    pub window_ms: usize,
    pub step_ms: usize,
    pub num_channels: usize,
    pub lower_band_limit_hz: f32,
    pub upper_band_limit_hz: f32,
    pub log_scale_shift: u32,
}

impl FrontendSettings {
    pub fn window_samples(&self) -> usize {
        self.sample_rate / 1000 * self.window_ms
    }

    pub fn step_samples(&self) -> usize {
        self.sample_rate / 1000 * self.step_ms
    }
}

/// DSP transform capability
///
/// `process_samples` receives exactly one step of new audio and returns the
/// energies for the window ending at that step. An output whose width
/// differs from the configured channel count (typically empty while the
/// first window fills) means "no features for this step".
pub trait FeatureFrontend: Send {
    fn configure(&mut self, settings: &FrontendSettings) -> Result<(), FrontendError>;

    fn process_samples(&mut self, samples: &[AudioSample]) -> &[u16];

    /// Forget any buffered audio
    fn reset(&mut self);
}

/// Log-mel filterbank frontend
pub struct FilterbankFrontend {
    settings: Option<FrontendSettings>,
    fft: Option<Arc<dyn Fft<f32>>>,
    hann: Vec<f32>,
    filters: Vec<MelFilter>,
    window: Vec<AudioSample>,
    filled: usize,
    spectrum: Vec<Complex<f32>>,
    output: Vec<u16>,
}

/// One triangular filter over a contiguous FFT bin range
struct MelFilter {
    start_bin: usize,
    weights: Vec<f32>,
}

impl FilterbankFrontend {
    pub fn new() -> Self {
        Self {
            settings: None,
            fft: None,
            hann: Vec::new(),
            filters: Vec::new(),
            window: Vec::new(),
            filled: 0,
            spectrum: Vec::new(),
            output: Vec::new(),
        }
    }

    fn compute_energies(&mut self) {
        let (Some(settings), Some(fft)) = (&self.settings, &self.fft) else {
            self.output.clear();
            return;
        };

        for (slot, value) in self.spectrum.iter_mut().enumerate() {
            *value = match (self.window.get(slot), self.hann.get(slot)) {
                (Some(&sample), Some(&w)) => Complex::new(sample as f32 * w, 0.0),
                _ => Complex::new(0.0, 0.0),
            };
        }
        fft.process(&mut self.spectrum);

        let scale = (1u32 << settings.log_scale_shift) as f32;
        self.output.clear();
        for filter in &self.filters {
            let magnitude: f32 = filter
                .weights
                .iter()
                .enumerate()
                .map(|(offset, weight)| self.spectrum[filter.start_bin + offset].norm() * weight)
                .sum();

            let value = (1.0 + magnitude).ln() * scale;
            self.output.push(value.round().clamp(0.0, u16::MAX as f32) as u16);
        }
    }
}

impl Default for FilterbankFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFrontend for FilterbankFrontend {
    fn configure(&mut self, settings: &FrontendSettings) -> Result<(), FrontendError> {
        let window_samples = settings.window_samples();
        let step_samples = settings.step_samples();

        if step_samples == 0 || window_samples < step_samples {
            return Err(FrontendError::InvalidSettings(format!(
                "window ({window_samples}) must cover at least one step ({step_samples})"
            )));
        }
        if settings.num_channels == 0 {
            return Err(FrontendError::InvalidSettings(
                "num_channels must be greater than 0".to_string(),
            ));
        }
        if settings.log_scale_shift > 15 {
            return Err(FrontendError::InvalidSettings(
                "log_scale_shift must be at most 15".to_string(),
            ));
        }

        let fft_size = window_samples.next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        self.fft = Some(planner.plan_fft_forward(fft_size));
        self.hann = create_hann_window(window_samples);
        self.filters = build_mel_filters(settings, fft_size)?;
        self.window = vec![0; window_samples];
        self.filled = 0;
        self.spectrum = vec![Complex::new(0.0, 0.0); fft_size];
        self.output = Vec::with_capacity(settings.num_channels);
        self.settings = Some(settings.clone());

        info!(
            "Frontend config: window_size={}ms, step_size={}ms, channels={}, sample_rate={}",
            settings.window_ms, settings.step_ms, settings.num_channels, settings.sample_rate
        );

        Ok(())
    }

    fn process_samples(&mut self, samples: &[AudioSample]) -> &[u16] {
        let Some(step) = self.settings.as_ref().map(FrontendSettings::step_samples) else {
            self.output.clear();
            return &self.output;
        };

        let room = self.window.len() - self.filled;
        let take = samples.len().min(room);
        self.window[self.filled..self.filled + take].copy_from_slice(&samples[..take]);
        self.filled += take;

        if self.filled < self.window.len() {
            self.output.clear();
            return &self.output;
        }

        self.compute_energies();

        self.window.copy_within(step.., 0);
        self.filled -= step;

        &self.output
    }

    fn reset(&mut self) {
        self.window.iter_mut().for_each(|s| *s = 0);
        self.filled = 0;
        self.output.clear();
        debug!("Frontend state reset");
    }
}

/// Periodic Hann window
fn create_hann_window(size: usize) -> Vec<f32> {
    let factor = 2.0 * std::f32::consts::PI / size as f32;
    (0..size)
        .map(|i| 0.5 - 0.5 * (i as f32 * factor).cos())
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Triangular filters evenly spaced on the mel scale between the band limits
fn build_mel_filters(
    settings: &FrontendSettings,
    fft_size: usize,
) -> Result<Vec<MelFilter>, FrontendError> {
    let nyquist = settings.sample_rate as f32 / 2.0;
    if settings.lower_band_limit_hz <= 0.0
        || settings.upper_band_limit_hz <= settings.lower_band_limit_hz
        || settings.upper_band_limit_hz > nyquist
    {
        return Err(FrontendError::InvalidSettings(format!(
            "band limits {}..{} Hz do not fit below {} Hz",
            settings.lower_band_limit_hz, settings.upper_band_limit_hz, nyquist
        )));
    }

    let channels = settings.num_channels;
    let mel_low = hz_to_mel(settings.lower_band_limit_hz);
    let mel_high = hz_to_mel(settings.upper_band_limit_hz);
    let mel_step = (mel_high - mel_low) / (channels + 1) as f32;
    let bin_hz = settings.sample_rate as f32 / fft_size as f32;
    let last_bin = fft_size / 2;

    let edges: Vec<f32> = (0..channels + 2)
        .map(|i| mel_to_hz(mel_low + mel_step * i as f32) / bin_hz)
        .collect();

    let filters = edges
        .windows(3)
        .map(|edge| {
            let (left, center, right) = (edge[0], edge[1], edge[2]);
            let start_bin = (left.floor() as usize).min(last_bin);
            let end_bin = (right.ceil() as usize).clamp(start_bin, last_bin);

            let weights = (start_bin..=end_bin)
                .map(|bin| {
                    let b = bin as f32;
                    if b <= left || b >= right {
                        0.0
                    } else if b <= center {
                        (b - left) / (center - left).max(f32::EPSILON)
                    } else {
                        (right - b) / (right - center).max(f32::EPSILON)
                    }
                })
                .collect();

            MelFilter { start_bin, weights }
        })
        .collect();

    Ok(filters)
}
