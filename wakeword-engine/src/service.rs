/// Detection service loop
///
/// Pulls audio from an `AudioSource`, feeds it to the engine one step at a
/// time and forwards detections as `WakeWordEvent`s.

use crate::engine::WakeWordEngine;
use crate::source::AudioSource;
use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Wake word detection event
#[derive(Debug, Clone, PartialEq)]
pub struct WakeWordEvent {
    /// Label of the model that fired
    pub label: String,

    /// Timestamp when the wake word was detected (microseconds since epoch)
    pub timestamp_micros: i64,

    /// Feature windows the engine had processed at detection time
    pub windows_processed: u64,
}

/// Totals for one service run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSummary {
    pub samples_read: u64,
    pub windows_processed: u64,
    pub detections: u64,
}

/// Run the engine over `source` until end of stream
///
/// Initializes and starts the engine if needed and always stops it before
/// returning. Replaces any detection callback already registered. Ends early
/// if the event receiver is dropped.
pub async fn run(
    engine: &mut WakeWordEngine,
    source: &mut dyn AudioSource,
    events: mpsc::UnboundedSender<WakeWordEvent>,
) -> anyhow::Result<ServiceSummary> {
    engine
        .initialize()
        .context("Failed to initialize wake word engine")?;
    engine.start().context("Failed to start wake word engine")?;

    let (label_tx, mut label_rx) = mpsc::unbounded_channel::<String>();
    engine.on_detected(move |label| {
        // The receiver lives until this function returns.
        let _ = label_tx.send(label.to_string());
    });

    let result = feed_until_end(engine, source, &events, &mut label_rx).await;
    engine.stop();

    let summary = result?;
    info!(
        "Service finished: {} samples, {} windows, {} detections",
        summary.samples_read, summary.windows_processed, summary.detections
    );
    Ok(summary)
}

async fn feed_until_end(
    engine: &mut WakeWordEngine,
    source: &mut dyn AudioSource,
    events: &mpsc::UnboundedSender<WakeWordEvent>,
    labels: &mut mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<ServiceSummary> {
    let mut summary = ServiceSummary::default();
    let chunk_size = engine.feed_size();

    while let Some(chunk) = source
        .read_chunk(chunk_size)
        .await
        .context("Failed to read audio")?
    {
        summary.samples_read += chunk.len() as u64;
        summary.windows_processed += engine.feed(&chunk) as u64;

        while let Ok(label) = labels.try_recv() {
            summary.detections += 1;
            let event = WakeWordEvent {
                label,
                timestamp_micros: current_timestamp_micros(),
                windows_processed: engine.stats().windows_processed,
            };
            if events.send(event).is_err() {
                warn!("Event receiver dropped, stopping service");
                return Ok(summary);
            }
        }

        // File sources never suspend on their own.
        tokio::task::yield_now().await;
    }

    Ok(summary)
}

/// Log every event until all senders are dropped, returning how many arrived
pub async fn log_events(mut events: mpsc::UnboundedReceiver<WakeWordEvent>) -> u64 {
    let mut received = 0;
    while let Some(event) = events.recv().await {
        received += 1;
        info!(
            "Wake word detected! label='{}', timestamp={}, window={}",
            event.label, event.timestamp_micros, event.windows_processed
        );
    }
    received
}

/// Get current timestamp in microseconds
fn current_timestamp_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
