//! Output sinks: rotating NDJSON files and stdout.
//!
//! # FileSink
//! Writes to `{prefix}-{instance_id}-{timestamp}.ndjson.active` and
//! rotates when a size or age threshold is reached: flush, fsync, close,
//! atomic rename to `.ndjson`, then open a new `.active` file. At most
//! one active file exists at any time; a completed file never carries the
//! `.active` suffix. The sink does not handle compression, retention, or
//! disk pressure.
//!
//! # StdoutSink
//! Writes raw bytes to stdout and flushes per write. A broken pipe is
//! logged and propagated; the pipeline treats it as a clean-exit signal.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::FileOutputConfig;

/// Capability shared by all sinks: append one serialized record, and
/// finalize on shutdown.
pub trait EventSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// StdoutSink
// ---------------------------------------------------------------------------

/// Write NDJSON bytes directly to stdout (debugging and dry-run).
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        StdoutSink
    }
}

impl EventSink for StdoutSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        let result = out.write_all(data).and_then(|()| out.flush());
        if let Err(e) = &result {
            if e.kind() == io::ErrorKind::BrokenPipe {
                warn!("stdout broken, consumer likely exited");
            }
        }
        result
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// The open active file plus its counters.
struct ActiveFile {
    writer: BufWriter<File>,
    active_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    events_since_flush: u64,
    opened_at: Instant,
    last_flush: Instant,
}

/// Rotating NDJSON file writer.
pub struct FileSink {
    output_dir: PathBuf,
    prefix: String,
    instance_id: String,
    rotation_interval: Duration,
    rotation_bytes: u64,
    flush_every_n: u64,
    flush_interval: Duration,
    active: Option<ActiveFile>,
}

impl FileSink {
    /// Create the output directory if needed and open the first active
    /// file.
    pub fn new(instance_id: &str, config: &FileOutputConfig) -> io::Result<Self> {
        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        let mut sink = FileSink {
            output_dir,
            prefix: config.file_prefix.clone(),
            instance_id: instance_id.to_owned(),
            rotation_interval: Duration::from_secs(config.rotation.interval_seconds),
            rotation_bytes: config.rotation.max_size_bytes,
            flush_every_n: config.flush.every_n_events,
            flush_interval: Duration::from_millis(config.flush.interval_ms),
            active: None,
        };
        sink.open_new_file()?;
        Ok(sink)
    }

    fn open_new_file(&mut self) -> io::Result<()> {
        let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
        let base = format!("{}-{}-{}", self.prefix, self.instance_id, ts);
        let active_path = self.output_dir.join(format!("{base}.ndjson.active"));
        let final_path = self.output_dir.join(format!("{base}.ndjson"));

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&active_path)?;
        info!(file = %active_path.display(), "opened new output file");

        let now = Instant::now();
        self.active = Some(ActiveFile {
            writer: BufWriter::new(file),
            active_path,
            final_path,
            bytes_written: 0,
            events_since_flush: 0,
            opened_at: now,
            last_flush: now,
        });
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        self.active.as_ref().is_some_and(|a| {
            a.bytes_written >= self.rotation_bytes || a.opened_at.elapsed() >= self.rotation_interval
        })
    }

    fn should_flush(&self) -> bool {
        self.active.as_ref().is_some_and(|a| {
            a.events_since_flush >= self.flush_every_n
                || a.last_flush.elapsed() >= self.flush_interval
        })
    }

    fn flush_active(&mut self) -> io::Result<()> {
        if let Some(active) = &mut self.active {
            active.writer.flush()?;
            active.events_since_flush = 0;
            active.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Flush, fsync, close, and atomically publish the active file.
    fn finalize_active(&mut self) -> io::Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        active.writer.flush()?;
        active.writer.get_ref().sync_all()?;
        drop(active.writer);
        std::fs::rename(&active.active_path, &active.final_path)?;
        info!(
            file = %active.final_path.display(),
            bytes = active.bytes_written,
            "completed output file"
        );
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.finalize_active()?;
        self.open_new_file()
    }
}

impl EventSink for FileSink {
    /// Append a record, rotating first if a threshold was reached and
    /// flushing afterwards when due.
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.should_rotate() {
            self.rotate()?;
        }

        let active = self
            .active
            .as_mut()
            .ok_or_else(|| io::Error::other("sink already closed"))?;
        active.writer.write_all(data)?;
        active.bytes_written += data.len() as u64;
        active.events_since_flush += 1;

        if self.should_flush() {
            self.flush_active()?;
        }
        Ok(())
    }

    /// Flush, fsync, and rename the active file. Idempotent.
    fn close(&mut self) -> io::Result<()> {
        self.finalize_active()
    }
}
