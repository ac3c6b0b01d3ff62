//! Logging initialization.
//!
//! Structured logs always go to stderr. When `logging.file.enabled` is
//! set, a second layer writes to a size-rotated file
//! (`app.log` → `app.log.1` … `app.log.N`). Both layers pass through the
//! secret redactor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogFileConfig;
use crate::redact::{Redactor, RedactingMakeWriter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(level: &str, redactor: &Redactor, file_config: &LogFileConfig) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_owned()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(io::stderr, redactor.clone()));

    let file_layer = if file_config.enabled {
        let writer = RotatingFileWriter::open(file_config)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(
                    Mutex::new(writer),
                    redactor.clone(),
                )),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Size-rotated log file writer
// ---------------------------------------------------------------------------

/// Appends to `path`; when the next write would exceed `max_size_bytes`,
/// shifts `path.1` → `path.2` … and renames `path` → `path.1` first.
/// With `backup_count` 0, rotation is disabled and the file grows.
pub struct RotatingFileWriter {
    path: PathBuf,
    max_size_bytes: u64,
    backup_count: u32,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    pub fn open(config: &LogFileConfig) -> io::Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(RotatingFileWriter {
            path,
            max_size_bytes: config.max_size_bytes,
            backup_count: config.backup_count,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for i in (1..self.backup_count).rev() {
            let from = backup_path(&self.path, i);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, i + 1))?;
            }
        }
        fs::rename(&self.path, backup_path(&self.path, 1))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{index}"));
    PathBuf::from(os)
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.backup_count > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_size_bytes
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
