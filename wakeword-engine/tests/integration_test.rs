/// Integration tests for the wake word engine
///
/// Drives the full pipeline (ring buffer, feature windowing, the bundled
/// interpreter and the detection engine) with a small compiled classifier.

use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use wakeword_engine::arena::{ArenaAllocator, MemoryTier, ARENA_ALIGNMENT};
use wakeword_engine::inference::{DType, Model, OpCode, OpDef, Subgraph, TensorDef};
use wakeword_engine::{
    service, AudioSample, EngineConfig, EngineError, FeatureFrontend, FrontendError,
    FrontendSettings, MicroInterpreterFactory, ModelConfig, ModelState, TieredAllocator,
    WakeWordEngine, WakeWordEvent, WavFileSource, SAMPLE_RATE,
};

const STEP: usize = 160;
const STRIDE: usize = 3;
const FEATURES: usize = 40;

/// Generate synthetic audio tone
fn generate_tone(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<i16> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;

    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = amplitude * (2.0 * PI * frequency * t).sin();
            (sample * i16::MAX as f32) as i16
        })
        .collect()
}

/// Stride-3 classifier: the mean feature value through a logistic
///
/// All-127 features give a uint8 probability of 255, all -128 give 0.
fn compiled_classifier() -> Vec<u8> {
    let width = STRIDE * FEATURES;

    let mut graph = Subgraph::default();
    let input =
        graph.add_tensor(TensorDef::new(DType::Int8, &[1, STRIDE, FEATURES]).quantized(1.0, 0));
    let flat = graph.add_tensor(TensorDef::new(DType::Int8, &[1, width]).quantized(1.0, 0));
    let weights = graph.add_tensor(
        TensorDef::int8_const(&[1, width], &vec![1; width]).quantized(1.0 / width as f32, 0),
    );
    let bias =
        graph.add_tensor(TensorDef::int32_const(&[1], &[0]).quantized(1.0 / width as f32, 0));
    let logit = graph.add_tensor(TensorDef::new(DType::Int8, &[1, 1]).quantized(1.0, 0));
    let probability =
        graph.add_tensor(TensorDef::new(DType::UInt8, &[1, 1]).quantized(1.0 / 256.0, 0));
    graph.inputs = vec![input];
    graph.outputs = vec![probability];

    graph.add_op(OpDef::new(OpCode::Reshape, &[input], &[flat]));
    graph.add_op(
        OpDef::new(OpCode::FullyConnected, &[flat, weights, bias], &[logit]).with_params(&[0]),
    );
    graph.add_op(OpDef::new(OpCode::Logistic, &[logit], &[probability]));

    Model::new(vec![graph]).to_bytes()
}

/// Frontend reporting the same energy on every channel
struct ConstFrontend {
    energy: u16,
    output: Vec<u16>,
}

impl FeatureFrontend for ConstFrontend {
    fn configure(&mut self, settings: &FrontendSettings) -> Result<(), FrontendError> {
        self.output = vec![self.energy; settings.num_channels];
        Ok(())
    }

    fn process_samples(&mut self, _samples: &[AudioSample]) -> &[u16] {
        &self.output
    }

    fn reset(&mut self) {}
}

fn test_config(refractory: usize) -> EngineConfig {
    let mut config = EngineConfig::default().with_model(
        ModelConfig::wake_word("hey aether", compiled_classifier())
            .with_cutoff(0.9)
            .with_sliding_window(2)
            .with_arena_size(4096),
    );
    config.refractory_slices = refractory;
    config
}

/// 666 quantizes to the int8 maximum
fn loud_engine(config: EngineConfig, allocator: Arc<TieredAllocator>) -> WakeWordEngine {
    WakeWordEngine::new(
        config,
        Box::new(ConstFrontend {
            energy: 666,
            output: Vec::new(),
        }),
        Box::new(MicroInterpreterFactory),
        allocator,
    )
}

fn record_detections(engine: &mut WakeWordEngine) -> Arc<Mutex<Vec<String>>> {
    let detections = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&detections);
    engine.on_detected(move |label| sink.lock().unwrap().push(label.to_string()));
    detections
}

#[test]
fn test_single_detection_after_refractory_and_stride() {
    let refractory = 10;
    let mut engine = loud_engine(test_config(refractory), Arc::new(TieredAllocator::default()));
    engine.initialize().expect("Failed to initialize engine");
    let detections = record_detections(&mut engine);
    engine.start().expect("Failed to start engine");

    assert_eq!(engine.models()[0].stride(), Some(STRIDE));

    for _ in 0..refractory + STRIDE {
        assert_eq!(engine.feed(&[0; STEP]), 1);
    }

    assert_eq!(*detections.lock().unwrap(), vec!["hey aether".to_string()]);
    assert_eq!(engine.last_detected_wake_word(), Some("hey aether"));
}

#[test]
fn test_detections_respect_refractory_period() {
    let refractory = 10;
    let mut engine = loud_engine(test_config(refractory), Arc::new(TieredAllocator::default()));
    engine.initialize().expect("Failed to initialize engine");
    let detections = record_detections(&mut engine);
    engine.start().expect("Failed to start engine");

    let mut fired_at = Vec::new();
    for window in 1..=40 {
        let before = detections.lock().unwrap().len();
        engine.feed(&[0; STEP]);
        if detections.lock().unwrap().len() > before {
            fired_at.push(window);
        }
    }

    assert_eq!(fired_at, vec![10, 20, 30, 40]);
    assert_eq!(engine.stats().detections, 4);
}

#[test]
fn test_silence_never_fires() {
    let mut engine = WakeWordEngine::with_defaults(test_config(0));
    engine.initialize().expect("Failed to initialize engine");
    let detections = record_detections(&mut engine);
    engine.start().expect("Failed to start engine");

    let silence = vec![0i16; SAMPLE_RATE * 2];
    for chunk in silence.chunks(512) {
        engine.feed(chunk);
    }

    let stats = engine.stats();
    assert!(stats.windows_processed > 150, "Too few windows processed");
    assert_eq!(stats.detections, 0);
    assert!(detections.lock().unwrap().is_empty());

    // Silence quantizes to -128 everywhere, so the probability is 0.
    let model = &engine.models()[0];
    assert_eq!(model.probabilities(), vec![0.0, 0.0]);
}

#[test]
fn test_tone_is_processed_in_real_time_steps() {
    let mut engine = WakeWordEngine::with_defaults(test_config(74));
    engine.initialize().expect("Failed to initialize engine");
    engine.start().expect("Failed to start engine");
    assert_eq!(engine.feed_size(), STEP);

    let tone = generate_tone(440.0, 1.0, 0.5);
    let processed: usize = tone.chunks(engine.feed_size()).map(|c| engine.feed(c)).sum();

    let stats = engine.stats();
    assert_eq!(processed as u64, stats.windows_processed);
    assert_eq!(stats.windows_processed + stats.feature_failures, 100);
    assert_eq!(stats.buffer_fill_percent, 0.0);
    assert_eq!(stats.inference_failures, 0);
    assert!(stats.is_running);
}

#[test]
fn test_failed_start_releases_everything_and_is_retriable() {
    let allocator = Arc::new(TieredAllocator::new(8192, 0));
    let mut config = test_config(10);
    config
        .models
        .push(ModelConfig::voice_activity(compiled_classifier()).with_arena_size(4096));
    let mut engine = loud_engine(config, Arc::clone(&allocator));
    engine.initialize().expect("Failed to initialize engine");

    // Leave room for only one of the two arenas.
    let hog = allocator
        .allocate(2048, ARENA_ALIGNMENT, MemoryTier::Internal)
        .expect("Failed to reserve memory");

    let result = engine.start();
    assert!(matches!(result, Err(EngineError::ModelLoad { ref label, .. }) if label == "VAD"));
    assert!(!engine.is_running());
    assert_eq!(allocator.in_use(MemoryTier::Internal), 2048);
    for model in engine.models() {
        assert_eq!(model.state(), ModelState::Unloaded);
    }

    drop(hog);
    engine.start().expect("Retry should succeed once memory is free");
    assert!(engine.models().iter().all(|m| m.is_loaded()));
    assert_eq!(allocator.in_use(MemoryTier::Internal), 8192);

    engine.stop();
    assert_eq!(allocator.in_use(MemoryTier::Internal), 0);
}

#[test]
fn test_oversized_model_fails_start_cleanly() {
    let mut graph = Subgraph::default();
    let input =
        graph.add_tensor(TensorDef::new(DType::Int8, &[1, STRIDE, FEATURES]).quantized(1.0, 0));
    let output = graph.add_tensor(TensorDef::new(DType::Int8, &[1 << 20; 4]).quantized(1.0, 0));
    graph.inputs = vec![input];
    graph.outputs = vec![output];
    graph.add_op(OpDef::new(OpCode::Reshape, &[input], &[output]));
    let oversized = Model::new(vec![graph]).to_bytes();

    let allocator = Arc::new(TieredAllocator::default());
    let mut config = test_config(10);
    config
        .models
        .push(ModelConfig::wake_word("oversized", oversized).with_arena_size(4096));
    let mut engine = loud_engine(config, Arc::clone(&allocator));
    engine.initialize().expect("Failed to initialize engine");

    let result = engine.start();
    assert!(matches!(result, Err(EngineError::ModelLoad { ref label, .. }) if label == "oversized"));
    assert!(!engine.is_running());
    assert_eq!(allocator.in_use(MemoryTier::Internal), 0);
    for model in engine.models() {
        assert_eq!(model.state(), ModelState::Unloaded);
    }
}

#[test]
fn test_unload_from_another_thread() {
    let mut engine = loud_engine(test_config(0), Arc::new(TieredAllocator::default()));
    engine.initialize().expect("Failed to initialize engine");
    let detections = record_detections(&mut engine);
    engine.start().expect("Failed to start engine");

    let model = Arc::clone(&engine.models()[0]);
    std::thread::spawn(move || model.unload())
        .join()
        .expect("Unload thread panicked");

    for _ in 0..20 {
        engine.feed(&[0; STEP]);
    }
    assert!(detections.lock().unwrap().is_empty());
    assert_eq!(engine.stats().inference_failures, 20);
}

#[tokio::test]
async fn test_service_over_wav_file() {
    let dir = TempDir::new().unwrap();

    std::fs::write(dir.path().join("hey_aether.mwwm"), compiled_classifier()).unwrap();
    let config_path = dir.path().join("engine.json");
    std::fs::write(
        &config_path,
        r#"{
            "refractory_slices": 20,
            "models": [{
                "kind": "wake_word",
                "label": "hey aether",
                "path": "hey_aether.mwwm",
                "probability_cutoff": 0.9,
                "sliding_window_size": 2,
                "arena_size": 4096
            }]
        }"#,
    )
    .unwrap();

    let wav_path = dir.path().join("silence.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&wav_path, spec).unwrap();
    for _ in 0..SAMPLE_RATE {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();

    let config = EngineConfig::from_json_file(&config_path).expect("Failed to load config");
    let mut engine = WakeWordEngine::with_defaults(config);
    let mut source = WavFileSource::open(&wav_path, SAMPLE_RATE).expect("Failed to open WAV");
    let (tx, mut rx) = mpsc::unbounded_channel::<WakeWordEvent>();

    let summary = service::run(&mut engine, &mut source, tx)
        .await
        .expect("Service failed");

    assert_eq!(summary.samples_read, SAMPLE_RATE as u64);
    assert!(summary.windows_processed > 90);
    assert_eq!(summary.detections, 0);
    assert!(rx.recv().await.is_none());
    assert!(!engine.is_running());
}
