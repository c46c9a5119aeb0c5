/// Wake word detection engine
///
/// Buffers incoming audio, turns every 10ms step into a feature vector, feeds
/// it to each streaming model in registration order and reports the first
/// model whose decision rule fires. A refractory counter keeps detections
/// at least `refractory_slices` windows apart.

use crate::arena::{ArenaAllocator, TieredAllocator};
use crate::audio_buffer::{AudioRingBuffer, AudioSample};
use crate::config::{ConfigError, EngineConfig, ModelKind};
use crate::features::{FeatureError, FeatureWindower};
use crate::frontend::{FeatureFrontend, FilterbankFrontend};
use crate::inference::{
    InferenceError, InterpreterFactory, MicroInterpreterFactory, OpResolver, STREAMING_OP_CAPACITY,
};
use crate::streaming_model::{ModelError, StreamingModel};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feature pipeline error: {0}")]
    Features(#[from] FeatureError),

    #[error("Op registration failed: {0}")]
    OpRegistration(#[from] InferenceError),

    #[error("Failed to load model '{label}': {source}")]
    ModelLoad {
        label: String,
        #[source]
        source: ModelError,
    },
}

/// Detection callback, invoked with the firing model's label
pub type DetectionCallback = Box<dyn FnMut(&str) + Send>;

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub windows_processed: u64,
    pub feature_failures: u64,
    pub inference_failures: u64,
    pub detections: u64,
    pub buffer_fill_percent: f32,
    pub is_running: bool,
}

/// Streaming wake word engine
pub struct WakeWordEngine {
    config: EngineConfig,
    ring_buffer: AudioRingBuffer,
    windower: FeatureWindower,
    features: Vec<i8>,
    factory: Box<dyn InterpreterFactory>,
    allocator: Arc<dyn ArenaAllocator>,
    resolver: OpResolver,
    models: Vec<Arc<StreamingModel>>,
    callback: Option<DetectionCallback>,
    refractory: i32,
    initialized: bool,
    running: bool,
    last_detected: Option<String>,
    windows_processed: u64,
    feature_failures: u64,
    inference_failures: u64,
    detections: u64,
}

impl WakeWordEngine {
    /// Create an engine from its capabilities
    ///
    /// Nothing is validated or allocated until `initialize`.
    pub fn new(
        config: EngineConfig,
        frontend: Box<dyn FeatureFrontend>,
        factory: Box<dyn InterpreterFactory>,
        allocator: Arc<dyn ArenaAllocator>,
    ) -> Self {
        let ring_buffer = AudioRingBuffer::with_capacity(config.ring_buffer_samples)
            .with_sample_rate(config.sample_rate);

        Self {
            config,
            ring_buffer,
            windower: FeatureWindower::new(frontend),
            features: Vec::new(),
            factory,
            allocator,
            resolver: OpResolver::with_capacity(STREAMING_OP_CAPACITY),
            models: Vec::new(),
            callback: None,
            refractory: 0,
            initialized: false,
            running: false,
            last_detected: None,
            windows_processed: 0,
            feature_failures: 0,
            inference_failures: 0,
            detections: 0,
        }
    }

    /// Engine with the bundled frontend, interpreter and tiered allocator
    pub fn with_defaults(config: EngineConfig) -> Self {
        Self::new(
            config,
            Box::new(FilterbankFrontend::new()),
            Box::new(MicroInterpreterFactory),
            Arc::new(TieredAllocator::default()),
        )
    }

    /// Validate configuration, configure the frontend, register the
    /// streaming op set and create every model (unloaded)
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }

        self.config.validate()?;
        self.windower.configure(&self.config.frontend_settings())?;

        let mut resolver = OpResolver::with_capacity(STREAMING_OP_CAPACITY);
        resolver.register_streaming_ops()?;

        let mut models = Vec::with_capacity(self.config.models.len());
        for model_config in &self.config.models {
            let data = model_config.model_data()?;
            models.push(Arc::new(StreamingModel::new(
                model_config,
                data,
                self.config.feature_size,
            )));
        }

        info!("Initializing wake word engine");
        info!(
            "Feature cadence: {}ms window, {}ms step ({} samples), {} features",
            self.config.window_ms,
            self.config.step_ms,
            self.config.step_samples(),
            self.config.feature_size
        );
        for model in &models {
            let kind = match model.kind() {
                ModelKind::WakeWord => "wake word",
                ModelKind::VoiceActivity => "voice activity",
            };
            info!(
                "Registered {} model '{}' (cutoff {:.2}, window {})",
                kind,
                model.label(),
                model.probability_cutoff(),
                model.sliding_window_size()
            );
        }

        self.features = vec![0; self.config.feature_size];
        self.resolver = resolver;
        self.models = models;
        self.initialized = true;
        Ok(())
    }

    /// Load every model and begin accepting audio
    ///
    /// If any model fails to load, every model is unloaded again and the
    /// engine stays stopped; `start` may be retried.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }

        if self.running {
            warn!("Engine already running");
            return Ok(());
        }

        for model in &self.models {
            if let Err(source) =
                model.load(self.factory.as_ref(), &self.resolver, self.allocator.as_ref())
            {
                warn!("Rolling back: unloading all models");
                for loaded in &self.models {
                    loaded.unload();
                }
                return Err(EngineError::ModelLoad {
                    label: model.label().to_string(),
                    source,
                });
            }
        }

        self.windower.allocate_scratch();
        self.ring_buffer.clear();
        self.windower.reset();
        for model in &self.models {
            model.reset_probabilities();
        }
        self.refractory = -self.refractory_slices();
        self.running = true;

        info!("Wake word engine started with {} models", self.models.len());
        Ok(())
    }

    /// Unload every model and stop accepting audio; safe to repeat
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        for model in &self.models {
            model.unload();
        }
        self.windower.release_scratch();
        self.running = false;

        info!("Wake word engine stopped");
    }

    fn refractory_slices(&self) -> i32 {
        i32::try_from(self.config.refractory_slices).unwrap_or(i32::MAX)
    }

    /// Push audio through the pipeline
    ///
    /// Returns the number of feature windows processed. Detections are
    /// reported through the callback before this returns.
    pub fn feed(&mut self, samples: &[AudioSample]) -> usize {
        if !self.running || samples.is_empty() {
            return 0;
        }

        self.ring_buffer.write(samples);

        let mut processed = 0;
        while self.ring_buffer.available() >= self.windower.step_samples() {
            let buffered = self.ring_buffer.available();
            match self.windower.extract(&mut self.ring_buffer, &mut self.features) {
                Ok(()) => {}
                Err(FeatureError::InsufficientSamples { .. }) => break,
                Err(e) => {
                    debug!("Skipping window: {}", e);
                    self.feature_failures += 1;
                    // Errors that consumed nothing would repeat forever.
                    if self.ring_buffer.available() == buffered {
                        break;
                    }
                    continue;
                }
            }
            processed += 1;
            self.windows_processed += 1;

            for model in &self.models {
                match model.infer(&self.features) {
                    Ok(()) => {}
                    Err(ModelError::NotLoaded(label)) => {
                        trace!("Model '{}' not loaded, skipping", label);
                        self.inference_failures += 1;
                    }
                    Err(e) => {
                        warn!("Inference failed for '{}': {}", model.label(), e);
                        self.inference_failures += 1;
                    }
                }
            }

            self.refractory = (self.refractory + 1).min(0);
            if self.refractory < 0 {
                continue;
            }

            if let Some(model) = self.models.iter().find(|m| m.determine_detected()) {
                let label = model.label().to_string();
                info!("Detected '{}'", label);

                if let Some(callback) = self.callback.as_mut() {
                    callback(&label);
                }

                self.last_detected = Some(label);
                self.detections += 1;
                self.refractory = -self.refractory_slices();
                for model in &self.models {
                    model.reset_probabilities();
                }
            }
        }

        if self.windows_processed > 0 && self.windows_processed % 1000 == 0 && processed > 0 {
            debug!(
                "Processed {} windows, detected {} wake words",
                self.windows_processed, self.detections
            );
        }

        processed
    }

    /// Register the detection callback, replacing any previous one
    pub fn on_detected<F>(&mut self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Samples one feature step consumes; 0 while stopped
    pub fn feed_size(&self) -> usize {
        if self.running {
            self.windower.step_samples()
        } else {
            0
        }
    }

    pub fn last_detected_wake_word(&self) -> Option<&str> {
        self.last_detected.as_deref()
    }

    /// Model handles, in evaluation order
    pub fn models(&self) -> &[Arc<StreamingModel>] {
        &self.models
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Get current statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            windows_processed: self.windows_processed,
            feature_failures: self.feature_failures,
            inference_failures: self.inference_failures,
            detections: self.detections,
            buffer_fill_percent: self.ring_buffer.available() as f32
                / self.ring_buffer.capacity() as f32
                * 100.0,
            is_running: self.running,
        }
    }
}

impl Drop for WakeWordEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::MemoryTier;
    use crate::config::ModelConfig;
    use crate::frontend::{FrontendError, FrontendSettings};
    use crate::inference::{
        Interpreter, MockInterpreter, MockInterpreterFactory, OutputTensor, OutputValue,
    };
    use std::sync::Mutex as StdMutex;

    const FEATURES: usize = 4;

    /// Emits a constant energy for every step after `warm_up` empty steps
    struct ConstFrontend {
        energy: u16,
        warm_up: usize,
        calls: usize,
        channels: usize,
        output: Vec<u16>,
    }

    impl ConstFrontend {
        fn new(energy: u16, warm_up: usize) -> Self {
            Self {
                energy,
                warm_up,
                calls: 0,
                channels: 0,
                output: Vec::new(),
            }
        }
    }

    impl FeatureFrontend for ConstFrontend {
        fn configure(&mut self, settings: &FrontendSettings) -> Result<(), FrontendError> {
            self.channels = settings.num_channels;
            Ok(())
        }

        fn process_samples(&mut self, _samples: &[AudioSample]) -> &[u16] {
            self.calls += 1;
            self.output.clear();
            if self.calls > self.warm_up {
                self.output.resize(self.channels, self.energy);
            }
            &self.output
        }

        fn reset(&mut self) {
            self.calls = 0;
        }
    }

    fn confident_interpreter(probability: f32) -> MockInterpreter {
        let mut interpreter = MockInterpreter::new();
        interpreter.expect_allocate_tensors().returning(|_| Ok(()));
        interpreter
            .expect_input_dims()
            .return_const(vec![1, 1, FEATURES]);
        interpreter
            .expect_write_input()
            .returning(|_, _, _| Ok(()));
        interpreter.expect_invoke().returning(|_| Ok(()));
        interpreter.expect_output().returning(move |_| {
            Ok(OutputTensor {
                value: OutputValue::Float32(probability),
                quantization: None,
            })
        });
        interpreter.expect_arena_used_bytes().return_const(1024usize);
        interpreter
    }

    fn confident_factory(probability: f32) -> MockInterpreterFactory {
        let mut factory = MockInterpreterFactory::new();
        factory.expect_create().returning(move |_, _| {
            Ok(Box::new(confident_interpreter(probability)) as Box<dyn Interpreter>)
        });
        factory
    }

    fn config(refractory: usize) -> EngineConfig {
        let mut config = EngineConfig::default().with_model(
            ModelConfig::wake_word("hey aether", vec![0u8; 8])
                .with_sliding_window(1)
                .with_cutoff(0.5)
                .with_arena_size(2048),
        );
        config.feature_size = FEATURES;
        config.refractory_slices = refractory;
        config
    }

    fn engine(
        config: EngineConfig,
        frontend: ConstFrontend,
        factory: MockInterpreterFactory,
    ) -> (WakeWordEngine, Arc<TieredAllocator>) {
        let allocator = Arc::new(TieredAllocator::new(16 * 1024, 16 * 1024));
        let engine = WakeWordEngine::new(
            config,
            Box::new(frontend),
            Box::new(factory),
            Arc::clone(&allocator) as Arc<dyn ArenaAllocator>,
        );
        (engine, allocator)
    }

    fn record_detections(engine: &mut WakeWordEngine) -> Arc<StdMutex<Vec<String>>> {
        let detections = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&detections);
        engine.on_detected(move |label| sink.lock().unwrap().push(label.to_string()));
        detections
    }

    #[test]
    fn test_start_requires_initialize() {
        let (mut engine, _) = engine(config(3), ConstFrontend::new(0, 0), confident_factory(1.0));
        assert!(matches!(engine.start(), Err(EngineError::NotInitialized)));
        assert_eq!(engine.feed(&[0; 160]), 0);
        assert_eq!(engine.feed_size(), 0);
    }

    #[test]
    fn test_initialize_requires_wake_word_model() {
        let mut config = config(3);
        config.models = vec![ModelConfig::voice_activity(vec![0u8; 8])];
        let (mut engine, _) = engine(config, ConstFrontend::new(0, 0), confident_factory(1.0));

        assert!(matches!(engine.initialize(), Err(EngineError::Config(_))));
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_lifecycle() {
        let (mut engine, allocator) =
            engine(config(3), ConstFrontend::new(0, 0), confident_factory(0.0));
        engine.initialize().unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.models().len(), 1);

        engine.start().unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.feed_size(), 160);
        assert_eq!(allocator.in_use(MemoryTier::Internal), 2048);

        // Starting twice is harmless.
        engine.start().unwrap();

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.feed_size(), 0);
        assert_eq!(allocator.in_use(MemoryTier::Internal), 0);
        assert!(!engine.models()[0].is_loaded());
    }

    #[test]
    fn test_refractory_spacing() {
        let (mut engine, _) = engine(config(3), ConstFrontend::new(0, 0), confident_factory(1.0));
        engine.initialize().unwrap();
        let detections = record_detections(&mut engine);
        engine.start().unwrap();

        let processed = engine.feed(&[0; 160 * 12]);

        assert_eq!(processed, 6);
        // The 1024-sample buffer keeps only the newest six steps of this chunk.
        assert_eq!(detections.lock().unwrap().len(), 2);
        assert_eq!(engine.last_detected_wake_word(), Some("hey aether"));

        for _ in 0..6 {
            engine.feed(&[0; 160]);
        }
        let stats = engine.stats();
        assert_eq!(stats.windows_processed, 12);
        assert_eq!(stats.detections, 4);
        assert_eq!(detections.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_failed_windows_do_not_advance_refractory() {
        let (mut engine, _) = engine(config(1), ConstFrontend::new(0, 2), confident_factory(1.0));
        engine.initialize().unwrap();
        let detections = record_detections(&mut engine);
        engine.start().unwrap();

        assert_eq!(engine.feed(&[0; 160]), 0);
        assert_eq!(engine.feed(&[0; 160]), 0);
        assert!(detections.lock().unwrap().is_empty());

        assert_eq!(engine.feed(&[0; 160]), 1);
        assert_eq!(detections.lock().unwrap().len(), 1);
        assert_eq!(engine.stats().feature_failures, 2);
    }

    #[test]
    fn test_first_firing_model_wins_and_silences_all() {
        let mut config = config(1);
        config.models.insert(
            0,
            ModelConfig::voice_activity(vec![0u8; 8])
                .with_sliding_window(1)
                .with_arena_size(2048),
        );
        let (mut engine, _) = engine(config, ConstFrontend::new(0, 0), confident_factory(1.0));
        engine.initialize().unwrap();
        let detections = record_detections(&mut engine);
        engine.start().unwrap();

        engine.feed(&[0; 160]);
        assert_eq!(*detections.lock().unwrap(), vec!["VAD".to_string()]);
        for model in engine.models() {
            assert_eq!(model.probabilities(), vec![0.0]);
        }
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let mut config = config(3);
        config.models.push(
            ModelConfig::wake_word("too big", vec![0u8; 8]).with_arena_size(64 * 1024),
        );
        let (mut engine, allocator) =
            engine(config, ConstFrontend::new(0, 0), confident_factory(1.0));
        engine.initialize().unwrap();

        let result = engine.start();
        assert!(matches!(
            result,
            Err(EngineError::ModelLoad { ref label, .. }) if label == "too big"
        ));
        assert!(!engine.is_running());
        assert_eq!(allocator.in_use(MemoryTier::Internal), 0);
        assert_eq!(allocator.in_use(MemoryTier::External), 0);
        for model in engine.models() {
            assert!(!model.is_loaded());
        }

        // Retrying fails the same way without leaking arenas.
        assert!(engine.start().is_err());
        assert_eq!(allocator.in_use(MemoryTier::Internal), 0);
    }

    #[test]
    fn test_models_unloaded_elsewhere_are_skipped() {
        let (mut engine, _) = engine(config(0), ConstFrontend::new(0, 0), confident_factory(1.0));
        engine.initialize().unwrap();
        let detections = record_detections(&mut engine);
        engine.start().unwrap();

        let handle = Arc::clone(&engine.models()[0]);
        std::thread::spawn(move || handle.unload()).join().unwrap();

        assert_eq!(engine.feed(&[0; 320]), 2);
        assert!(detections.lock().unwrap().is_empty());
        assert_eq!(engine.stats().inference_failures, 2);
    }
}
