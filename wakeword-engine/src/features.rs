/// Feature windowing
///
/// Drains one step of audio from the ring buffer, runs the frontend over it
/// and quantizes the energies into the int8 vector the models consume.

use crate::audio_buffer::{AudioRingBuffer, AudioSample};
use crate::frontend::{FeatureFrontend, FrontendError, FrontendSettings};
use thiserror::Error;
use tracing::{debug, trace};

/// Quantization scale for frontend energies
pub const FEATURE_VALUE_SCALE: i32 = 256;

/// Quantization divisor (25.6 * 26.0, rounded)
pub const FEATURE_VALUE_DIV: i32 = 666;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Insufficient audio: need {needed} samples, {available} buffered")]
    InsufficientSamples { needed: usize, available: usize },

    #[error("Partial read: got {read} samples, needed {needed}")]
    ShortRead { read: usize, needed: usize },

    #[error("Frontend output size mismatch: expected {expected}, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("Feature output holds {actual} values, expected {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("Scratch buffer not allocated")]
    ScratchUnallocated,

    #[error("Feature windower is not configured")]
    NotConfigured,

    #[error("Frontend error: {0}")]
    Frontend(#[from] FrontendError),
}

/// Quantize one frontend energy to int8
///
/// `round(v * 256 / 666) - 128` with round-half-up, saturated to i8.
pub fn quantize_energy(value: u16) -> i8 {
    let scaled =
        (value as i32 * FEATURE_VALUE_SCALE + FEATURE_VALUE_DIV / 2) / FEATURE_VALUE_DIV - 128;
    scaled.clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

/// Turns buffered audio into quantized feature vectors, one step at a time
pub struct FeatureWindower {
    frontend: Box<dyn FeatureFrontend>,
    step_samples: usize,
    feature_size: usize,
    scratch: Vec<AudioSample>,
}

impl FeatureWindower {
    /// Wrap an unconfigured frontend
    pub fn new(frontend: Box<dyn FeatureFrontend>) -> Self {
        Self {
            frontend,
            step_samples: 0,
            feature_size: 0,
            scratch: Vec::new(),
        }
    }

    /// Configure the frontend and fix the step/width for this windower
    pub fn configure(&mut self, settings: &FrontendSettings) -> Result<(), FeatureError> {
        self.frontend.configure(settings)?;
        self.step_samples = settings.step_samples();
        self.feature_size = settings.num_channels;
        self.scratch = Vec::new();
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.step_samples > 0
    }

    pub fn step_samples(&self) -> usize {
        self.step_samples
    }

    pub fn feature_size(&self) -> usize {
        self.feature_size
    }

    /// Allocate the step-sized scratch buffer (no-op if already allocated)
    pub fn allocate_scratch(&mut self) {
        if self.scratch.len() != self.step_samples {
            self.scratch = vec![0; self.step_samples];
        }
    }

    /// Free the scratch buffer
    pub fn release_scratch(&mut self) {
        self.scratch = Vec::new();
    }

    /// Reset the frontend's sliding window
    pub fn reset(&mut self) {
        self.frontend.reset();
    }

    /// Extract one feature vector into `features`
    ///
    /// On any error the caller must not advance model state.
    pub fn extract(
        &mut self,
        buffer: &mut AudioRingBuffer,
        features: &mut [i8],
    ) -> Result<(), FeatureError> {
        if !self.is_configured() {
            return Err(FeatureError::NotConfigured);
        }

        if features.len() != self.feature_size {
            return Err(FeatureError::OutputSize {
                expected: self.feature_size,
                actual: features.len(),
            });
        }

        let available = buffer.available();
        if available < self.step_samples {
            return Err(FeatureError::InsufficientSamples {
                needed: self.step_samples,
                available,
            });
        }

        if self.scratch.len() != self.step_samples {
            return Err(FeatureError::ScratchUnallocated);
        }

        let read = buffer.read(&mut self.scratch);
        if read < self.step_samples {
            debug!("Partial read: got {} samples, needed {}", read, self.step_samples);
            return Err(FeatureError::ShortRead {
                read,
                needed: self.step_samples,
            });
        }

        let energies = self.frontend.process_samples(&self.scratch);
        if energies.len() != self.feature_size {
            return Err(FeatureError::WidthMismatch {
                expected: self.feature_size,
                actual: energies.len(),
            });
        }

        for (slot, &energy) in features.iter_mut().zip(energies) {
            *slot = quantize_energy(energy);
        }

        trace!(
            "Features extracted: first={}, min={:?}, max={:?}",
            features[0],
            features.iter().min(),
            features.iter().max()
        );

        Ok(())
    }
}
