//! Pipeline driver: connect → classify → filter → transform → sink.
//!
//! Records are processed in strict wire order; the transformer's ledger
//! is therefore updated in the order frames arrived. Broken pipe from the
//! sink is a clean-exit signal, not an error.

use futures_util::{Stream, StreamExt, pin_mut};
use tracing::{error, info, warn};

use crate::classifier::{Classification, classify};
use crate::config::AppConfig;
use crate::connection::{PolarisConnection, RawFrame, ShutdownHandle};
use crate::filter::EventFilter;
use crate::sink::EventSink;
use crate::transform::Transformer;

/// Records written before a dry run requests shutdown.
const DRY_RUN_LIMIT: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("sink: {0}")]
    Sink(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-frame processing stage, shared by the live driver and tests.
pub struct EventProcessor {
    instance_id: String,
    filter: EventFilter,
    transformer: Transformer,
}

impl EventProcessor {
    pub fn new(config: &AppConfig) -> Self {
        EventProcessor {
            instance_id: config.instance_id.clone(),
            filter: EventFilter::new(&config.filter),
            transformer: Transformer::new(&config.instance_id),
        }
    }

    /// Classify, filter, and transform one raw frame.
    ///
    /// Returns the serialized record to write, or `None` when the frame
    /// is a protocol no-op or filtered out.
    pub fn process(&mut self, frame: &RawFrame) -> Result<Option<Vec<u8>>, serde_json::Error> {
        let subscription_id = Some(frame.subscription_id.as_str());
        match classify(&frame.payload, &self.instance_id, subscription_id) {
            Classification::Ignored => Ok(None),
            Classification::Malformed(m) => self.transformer.transform_malformed(&m).map(Some),
            Classification::Device(devices) => match self.filter.apply(&devices) {
                None => Ok(None),
                Some(passed) => self.transformer.transform(passed, subscription_id).map(Some),
            },
        }
    }
}

/// Run the pipeline until the frame stream ends.
///
/// The sink is closed on every exit path; the number of records written
/// is returned.
pub async fn run(
    connection: PolarisConnection,
    config: &AppConfig,
    sink: &mut dyn EventSink,
    dry_run: bool,
) -> Result<u64, PipelineError> {
    let shutdown = connection.shutdown_handle();
    let mut processor = EventProcessor::new(config);
    let frames = connection.subscribe();
    pin_mut!(frames);

    let result = drive(&mut frames, &mut processor, sink, dry_run, &shutdown).await;
    let close_result = sink.close();

    match &result {
        Ok(written) => info!(processed = written, "pipeline shut down"),
        Err(e) => error!(error = %e, "pipeline terminated"),
    }
    let written = result?;
    close_result?;
    Ok(written)
}

async fn drive<S>(
    frames: &mut S,
    processor: &mut EventProcessor,
    sink: &mut dyn EventSink,
    dry_run: bool,
    shutdown: &ShutdownHandle,
) -> Result<u64, PipelineError>
where
    S: Stream<Item = RawFrame> + Unpin,
{
    let mut written: u64 = 0;
    while let Some(frame) = frames.next().await {
        let Some(record) = processor.process(&frame)? else {
            continue;
        };

        if let Err(e) = sink.write(&record) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                warn!("output consumer gone, shutting down");
                shutdown.request_shutdown();
                break;
            }
            shutdown.request_shutdown();
            return Err(e.into());
        }

        written += 1;
        if dry_run && written >= DRY_RUN_LIMIT {
            info!(received = written, "dry run complete");
            shutdown.request_shutdown();
            break;
        }
    }
    Ok(written)
}
