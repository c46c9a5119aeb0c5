/// Wake word engine library
///
/// Streaming wake word and voice activity detection over quantized models:
/// ring-buffered audio, a filterbank frontend producing int8 features every
/// 10ms, a small interpreter for the streaming op set and a detection engine
/// with per-model sliding windows and a refractory period.

pub mod arena;
pub mod audio_buffer;
pub mod config;
pub mod engine;
pub mod features;
pub mod frontend;
pub mod inference;
pub mod service;
pub mod source;
pub mod streaming_model;

// Re-export main types
pub use arena::{AllocError, Arena, ArenaAllocator, MemoryTier, TieredAllocator};
pub use audio_buffer::{AudioRingBuffer, AudioSample, BUFFER_SIZE, SAMPLE_RATE};
pub use config::{ConfigError, EngineConfig, ModelConfig, ModelKind};
pub use engine::{EngineError, EngineStats, WakeWordEngine};
pub use features::{quantize_energy, FeatureError, FeatureWindower};
pub use frontend::{FeatureFrontend, FilterbankFrontend, FrontendError, FrontendSettings};
pub use inference::{
    InferenceError, Interpreter, InterpreterFactory, MicroInterpreterFactory, OpResolver,
};
pub use service::{ServiceSummary, WakeWordEvent};
pub use source::{AudioSource, PcmStreamSource, SourceError, WavFileSource};
pub use streaming_model::{ModelError, ModelState, StreamingModel};
