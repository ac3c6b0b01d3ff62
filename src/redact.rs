//! Secret redaction for log output.
//!
//! At startup the resolved configuration is scanned for string values
//! whose keys match `logging.redact_patterns` (shell-style globs applied
//! to config keys, case-insensitive). Every log line passes through a
//! writer wrapper that replaces occurrences of those values with
//! `[REDACTED]` before they reach stderr or the log file.

use std::io::{self, Write};
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

pub const REDACTED: &str = "[REDACTED]";

/// Holds the known secret values and scrubs them out of text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Arc<Vec<String>>,
}

impl Redactor {
    /// Values of length ≤ 1 are dropped; they would shred the output.
    pub fn new(values: Vec<String>) -> Self {
        let secrets = values.into_iter().filter(|s| s.len() > 1).collect();
        Redactor {
            secrets: Arc::new(secrets),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for secret in self.secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

/// Walk a resolved config tree and collect values whose keys match any
/// pattern.
pub fn collect_secret_values(config: &Value, patterns: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    walk(config, patterns, &mut out);
    out
}

fn walk(value: &Value, patterns: &[String], out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if let Value::String(s) = val {
                    if patterns.iter().any(|p| glob_match(p, key)) {
                        out.push(s.clone());
                    }
                }
                walk(val, patterns, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, patterns, out);
            }
        }
        _ => {}
    }
}

/// Case-insensitive shell-style glob with `*` as the only wildcard.
fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let key = key.to_ascii_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || !key.ends_with(last) {
        return false;
    }

    let mut pos = first.len();
    let tail_start = key.len() - last.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match key.get(pos..tail_start).and_then(|s| s.find(part)) {
            Some(i) => pos += i + part.len(),
            None => return false,
        }
    }
    pos <= tail_start
}

// ---------------------------------------------------------------------------
// Writer wrapper for tracing-subscriber
// ---------------------------------------------------------------------------

/// `MakeWriter` adapter that scrubs secrets from every line written.
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Redactor,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Redactor) -> Self {
        RedactingMakeWriter { inner, redactor }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}

pub struct RedactingWriter<W: Write> {
    inner: W,
    redactor: Redactor,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(self.redactor.redact(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
