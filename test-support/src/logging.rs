//! Log capture for tests.
//!
//! Installs a thread-local JSON subscriber so assertions can inspect the
//! structured fields of emitted events. Works with `#[tokio::test]`, whose
//! runtime runs every spawned task on the test thread.

use serde_json::Value;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captured events, in emission order.
///
/// Capturing stops when the capture is dropped.
pub struct LogCapture {
    buf: Buffer,
    _guard: DefaultGuard,
}

impl std::fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCapture").finish_non_exhaustive()
    }
}

impl LogCapture {
    /// Capture events matching `filter` (e.g. `"info"`) on this thread.
    ///
    /// The filter is explicit so tests never depend on `RUST_LOG`.
    #[must_use]
    pub fn start(filter: &str) -> Self {
        let buf = Buffer::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_writer(move || writer.clone())
                .with_filter(EnvFilter::new(filter)),
        );
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buf, _guard: guard }
    }

    /// Every captured event as parsed JSON.
    ///
    /// # Panics
    /// Panics if a captured line is not valid JSON.
    #[must_use]
    pub fn events(&self) -> Vec<Value> {
        let raw = self
            .buf
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        String::from_utf8_lossy(&raw)
            .lines()
            .map(|line| serde_json::from_str(line).expect("log line is JSON"))
            .collect()
    }

    /// Messages of every captured event.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["fields"]["message"].as_str().map(str::to_owned))
            .collect()
    }

    /// Whether an event with exactly `message` was captured.
    #[must_use]
    pub fn contains(&self, message: &str) -> bool {
        self.messages().iter().any(|m| m == message)
    }
}
