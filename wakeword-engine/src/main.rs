/// Wake word detection service binary
///
/// Runs the engine over a WAV file given as the first argument, or over raw
/// s16le PCM on stdin, and logs every detection.

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wakeword_engine::{
    service, AudioSource, EngineConfig, ModelConfig, PcmStreamSource, WakeWordEngine,
    WakeWordEvent, WavFileSource,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wakeword_engine=info")),
        )
        .init();

    info!("Starting wake word detection service");

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Wake word detection service stopped");
}

async fn run() -> anyhow::Result<()> {
    let config = load_config().context("Failed to load configuration")?;

    let mut source: Box<dyn AudioSource> = match std::env::args().nth(1) {
        Some(path) => Box::new(
            WavFileSource::open(&path, config.sample_rate)
                .with_context(|| format!("Failed to open {}", path))?,
        ),
        None => {
            info!("Reading s16le PCM from stdin");
            Box::new(PcmStreamSource::new(tokio::io::stdin()))
        }
    };

    let mut engine = WakeWordEngine::with_defaults(config);

    let (event_tx, event_rx) = mpsc::unbounded_channel::<WakeWordEvent>();
    let logger = tokio::spawn(service::log_events(event_rx));

    let summary = service::run(&mut engine, source.as_mut(), event_tx).await?;
    logger.await.context("Event logger panicked")?;

    info!(
        "Processed {:.1}s of audio, {} detections",
        summary.samples_read as f64 / engine.config().sample_rate as f64,
        summary.detections
    );
    Ok(())
}

/// Load configuration from a JSON file or environment
fn load_config() -> anyhow::Result<EngineConfig> {
    if let Ok(path) = std::env::var("WAKEWORD_CONFIG") {
        info!("Loading configuration from {}", path);
        return Ok(EngineConfig::from_json_file(&path)?);
    }

    let model_path = std::env::var("WAKEWORD_MODEL_PATH")
        .unwrap_or_else(|_| "models/hey_aether.mwwm".to_string());

    let label = std::env::var("WAKEWORD_LABEL").unwrap_or_else(|_| "hey aether".to_string());

    let mut model = ModelConfig::wake_word_file(label, model_path);
    if let Ok(cutoff) = std::env::var("WAKEWORD_CUTOFF") {
        let cutoff = cutoff
            .parse::<f32>()
            .with_context(|| format!("WAKEWORD_CUTOFF is not a number: {}", cutoff))?;
        model = model.with_cutoff(cutoff);
    }

    Ok(EngineConfig::default().with_model(model))
}
