use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender, TrySendError};

use crate::hooks::Hook;
use crate::value::Value;

const QUEUE_CAPACITY: usize = 10_000;

/// Opt-in hook mirroring extracted values to an NDJSON file.
///
/// `post_extract` serializes and enqueues without blocking; a background
/// thread owns the file. When the queue is full, items are dropped and the
/// drop count is logged at widening intervals. The writer flushes on
/// shutdown.
pub struct NdjsonWriter {
    tx_line: Sender<String>,
    tx_stop: Sender<()>,
    dropped: AtomicU64,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NdjsonWriter {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let mut out = BufWriter::new(file);

        let (tx_line, rx_line) = bounded::<String>(QUEUE_CAPACITY);
        let (tx_stop, rx_stop) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("wxpath-ndjson-writer".into())
            .spawn(move || loop {
                select! {
                    recv(rx_stop) -> _ => {
                        for line in rx_line.try_iter() {
                            writeln!(out, "{line}").ok();
                        }
                        out.flush().ok();
                        break;
                    },
                    recv(rx_line) -> msg => match msg {
                        Ok(line) => {
                            if let Err(e) = writeln!(out, "{line}") {
                                log::error!("couldn't write NDJSON line: {e}");
                            }
                        }
                        Err(_) => {
                            out.flush().ok();
                            break;
                        }
                    },
                    default(Duration::from_secs(1)) => {
                        out.flush().ok();
                    },
                }
            })?;

        Ok(Self {
            tx_line,
            tx_stop,
            dropped: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Flush and stop the background thread. Called automatically on drop.
    pub fn finish(&self) {
        self.tx_stop.send(()).ok();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Hook for NdjsonWriter {
    fn post_extract(&self, value: Value) -> Option<Value> {
        let line = match serde_json::to_string(&value.to_json()) {
            Ok(line) => line,
            Err(e) => {
                log::error!("couldn't serialize value: {e}");
                return Some(value);
            }
        };

        match self.tx_line.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if matches!(dropped, 1 | 100 | 1000) || dropped % 10_000 == 0 {
                    log::warn!("NDJSON queue full; dropped {dropped} items so far");
                }
            }
        }

        // Always pass the value through.
        Some(value)
    }
}

impl Drop for NdjsonWriter {
    fn drop(&mut self) {
        self.finish();
    }
}
