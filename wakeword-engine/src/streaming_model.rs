/// Streaming model wrapper
///
/// Owns one interpreter and its tensor arena while loaded. Feature slices are
/// accumulated `stride` at a time before each invocation, and every output
/// probability lands in a fixed-length sliding window that the model's
/// decision rule reads.

use crate::arena::{
    allocate_with_fallback, AllocError, Arena, ArenaAllocator, MemoryTier, ARENA_ALIGNMENT,
};
use crate::config::{ModelConfig, ModelKind};
use crate::inference::{InferenceError, Interpreter, InterpreterFactory, OpResolver, OutputTensor, OutputValue};
use cache_padded::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Scale applied to uint8 outputs that carry no quantization parameters
pub const UINT8_FALLBACK_SCALE: f32 = 0.003906;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Tensor arena allocation failed: {0}")]
    Arena(#[from] AllocError),

    #[error("Inference engine error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Model input must be [1, stride, {feature_size}], got {dims:?}")]
    InputShape {
        dims: Vec<usize>,
        feature_size: usize,
    },

    #[error("Feature slice has {actual} values, model expects {expected}")]
    FeatureSize { expected: usize, actual: usize },
}

/// Model lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

/// Everything that only exists while the model is loaded
struct Runtime {
    // Field order matters: the interpreter is dropped before its arena.
    interpreter: Box<dyn Interpreter>,
    arena: Arena,
    stride: usize,
    current_stride_step: usize,
    probabilities: Vec<f32>,
    last_n_index: usize,
}

struct Slot {
    state: ModelState,
    runtime: Option<Runtime>,
}

/// Convert a raw output scalar into a probability
pub fn decode_probability(output: &OutputTensor) -> f32 {
    match output.value {
        OutputValue::Float32(p) => p,
        OutputValue::Int8(q) => (q as f32 + 128.0) / 255.0,
        OutputValue::UInt8(q) => match output.quantization {
            Some(params) if params.scale != 0.0 => (q as i32 - params.zero_point) as f32 * params.scale,
            _ => q as f32 * UINT8_FALLBACK_SCALE,
        },
    }
}

/// A wake word or voice activity model with streaming state
pub struct StreamingModel {
    label: String,
    kind: ModelKind,
    probability_cutoff: f32,
    sliding_window_size: usize,
    arena_size: usize,
    feature_size: usize,
    model_data: Arc<[u8]>,
    loaded: CachePadded<AtomicBool>,
    slot: Mutex<Slot>,
}

impl StreamingModel {
    /// Create an unloaded model
    pub fn new(config: &ModelConfig, model_data: Arc<[u8]>, feature_size: usize) -> Self {
        Self {
            label: config.display_label().to_string(),
            kind: config.kind,
            probability_cutoff: config.probability_cutoff,
            sliding_window_size: config.sliding_window_size,
            arena_size: config.arena_size,
            feature_size,
            model_data,
            loaded: CachePadded::new(AtomicBool::new(false)),
            slot: Mutex::new(Slot {
                state: ModelState::Unloaded,
                runtime: None,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn probability_cutoff(&self) -> f32 {
        self.probability_cutoff
    }

    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }

    pub fn state(&self) -> ModelState {
        self.slot.lock().state
    }

    /// Lock-free loaded check
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Feature slices per invocation, once loaded
    pub fn stride(&self) -> Option<usize> {
        self.slot.lock().runtime.as_ref().map(|r| r.stride)
    }

    /// Tier the arena was carved from, once loaded
    pub fn arena_tier(&self) -> Option<MemoryTier> {
        self.slot.lock().runtime.as_ref().map(|r| r.arena.tier())
    }

    /// Snapshot of the sliding window, empty when not loaded
    pub fn probabilities(&self) -> Vec<f32> {
        self.slot
            .lock()
            .runtime
            .as_ref()
            .map(|r| r.probabilities.clone())
            .unwrap_or_default()
    }

    pub fn sliding_window_average(&self) -> Option<f32> {
        let slot = self.slot.lock();
        let runtime = slot.runtime.as_ref()?;
        Some(runtime.probabilities.iter().sum::<f32>() / runtime.probabilities.len() as f32)
    }

    /// Allocate the arena, build the interpreter and prepare streaming state
    ///
    /// Loading an already loaded model is a no-op. On failure the model is
    /// left `Failed` with no arena held.
    pub fn load(
        &self,
        factory: &dyn InterpreterFactory,
        resolver: &OpResolver,
        allocator: &dyn ArenaAllocator,
    ) -> Result<(), ModelError> {
        let mut slot = self.slot.lock();
        if slot.state == ModelState::Loaded {
            debug!("Model '{}' already loaded", self.label);
            return Ok(());
        }

        slot.state = ModelState::Loading;
        match self.build_runtime(factory, resolver, allocator) {
            Ok(runtime) => {
                self.log_model_config(&runtime);
                slot.runtime = Some(runtime);
                slot.state = ModelState::Loaded;
                self.loaded.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!("Failed to load model '{}': {}", self.label, e);
                slot.runtime = None;
                slot.state = ModelState::Failed;
                Err(e)
            }
        }
    }

    fn build_runtime(
        &self,
        factory: &dyn InterpreterFactory,
        resolver: &OpResolver,
        allocator: &dyn ArenaAllocator,
    ) -> Result<Runtime, ModelError> {
        let mut arena = allocate_with_fallback(allocator, self.arena_size, ARENA_ALIGNMENT)?;
        let mut interpreter = factory.create(&self.model_data, resolver)?;
        interpreter.allocate_tensors(&mut arena)?;

        // Input must be rank 3, `[1, stride, feature_size]`. Rank 2 or rank 4
        // layouts of the same data are rejected rather than reinterpreted.
        let dims = interpreter.input_dims();
        let stride = match dims.as_slice() {
            &[1, stride, features] if stride > 0 && features == self.feature_size => stride,
            _ => {
                return Err(ModelError::InputShape {
                    dims,
                    feature_size: self.feature_size,
                })
            }
        };

        Ok(Runtime {
            interpreter,
            arena,
            stride,
            current_stride_step: 0,
            probabilities: vec![0.0; self.sliding_window_size],
            last_n_index: 0,
        })
    }

    /// Summarize the loaded model at info level
    fn log_model_config(&self, runtime: &Runtime) {
        info!(
            "Model '{}' loaded: kind={:?}, probability cutoff={:.3}, sliding window={}, stride={}",
            self.label, self.kind, self.probability_cutoff, self.sliding_window_size, runtime.stride
        );
        info!(
            "  Arena: {} of {} bytes used ({} memory)",
            runtime.interpreter.arena_used_bytes(),
            runtime.arena.len(),
            runtime.arena.tier()
        );
    }

    /// Feed one feature slice
    ///
    /// Every `stride`-th call invokes the model and records a probability.
    pub fn infer(&self, features: &[i8]) -> Result<(), ModelError> {
        if !self.is_loaded() {
            return Err(ModelError::NotLoaded(self.label.clone()));
        }

        let mut slot = self.slot.lock();
        if slot.state != ModelState::Loaded {
            return Err(ModelError::NotLoaded(self.label.clone()));
        }
        let Some(runtime) = slot.runtime.as_mut() else {
            return Err(ModelError::NotLoaded(self.label.clone()));
        };

        if features.len() != self.feature_size {
            runtime.current_stride_step = 0;
            return Err(ModelError::FeatureSize {
                expected: self.feature_size,
                actual: features.len(),
            });
        }

        let offset = runtime.current_stride_step * self.feature_size;
        if let Err(e) = runtime
            .interpreter
            .write_input(&mut runtime.arena, offset, features)
        {
            runtime.current_stride_step = 0;
            return Err(e.into());
        }

        runtime.current_stride_step += 1;
        if runtime.current_stride_step < runtime.stride {
            return Ok(());
        }
        runtime.current_stride_step = 0;

        runtime.interpreter.invoke(&mut runtime.arena)?;
        let output = runtime.interpreter.output(&runtime.arena)?;
        let probability = decode_probability(&output);

        runtime.probabilities[runtime.last_n_index] = probability;
        runtime.last_n_index = (runtime.last_n_index + 1) % runtime.probabilities.len();

        trace!("Model '{}' probability: {:.3}", self.label, probability);
        Ok(())
    }

    /// Zero the sliding window
    pub fn reset_probabilities(&self) {
        let mut slot = self.slot.lock();
        if let Some(runtime) = slot.runtime.as_mut() {
            runtime.probabilities.fill(0.0);
            runtime.last_n_index = 0;
        }
    }

    /// Apply the model's decision rule to the sliding window
    pub fn determine_detected(&self) -> bool {
        if !self.is_loaded() {
            return false;
        }

        let slot = self.slot.lock();
        let Some(runtime) = slot.runtime.as_ref().filter(|_| slot.state == ModelState::Loaded) else {
            return false;
        };
        let window = &runtime.probabilities;
        if window.is_empty() {
            return false;
        }

        match self.kind {
            ModelKind::WakeWord => {
                let average = window.iter().sum::<f32>() / window.len() as f32;
                if average > self.probability_cutoff {
                    let newest = (runtime.last_n_index + window.len() - 1) % window.len();
                    debug!(
                        "The '{}' model sliding average probability is {:.3} and most recent probability is {:.3}",
                        self.label, average, window[newest]
                    );
                    return true;
                }
                false
            }
            ModelKind::VoiceActivity => {
                let max = window.iter().copied().fold(f32::MIN, f32::max);
                max >= self.probability_cutoff
            }
        }
    }

    /// Release the interpreter and arena
    ///
    /// Idempotent, and safe after a failed load. Blocks while an inference
    /// is in progress on another thread.
    pub fn unload(&self) {
        let mut slot = self.slot.lock();
        self.loaded.store(false, Ordering::Release);

        if slot.state == ModelState::Unloaded && slot.runtime.is_none() {
            return;
        }

        slot.state = ModelState::Unloading;
        if slot.runtime.take().is_some() {
            info!("Model '{}' unloaded", self.label);
        }
        slot.state = ModelState::Unloaded;
    }
}

impl std::fmt::Debug for StreamingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingModel")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
