//! Buffers this process's log records and periodically flushes them to
//! control's `/log` endpoint via `ControlClient` (spec.md §6 `GET /log`:
//! "used by workers to push textual diagnostic lines to control for
//! aggregation"). A `log::Log` implementation rather than a call site at
//! every `log::info!`, so every target in this crate is forwarded without
//! having to thread a sink through each module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{Level, Log, Metadata, Record};

use crate::control_client::ControlClient;

/// Caps the buffer so a control outage does not grow this process's memory
/// without bound; oldest lines are dropped first (spec.md §7 "result loss
/// on transport failure is the caller's concern" - the same discipline
/// applied here to log lines).
const MAX_BUFFERED_LINES: usize = 1000;

type Buffer = Arc<Mutex<Vec<String>>>;

/// Installed as the global logger via `log::set_boxed_logger`. Wraps another
/// `Log` (e.g. `env_logger`'s) so local console output is unaffected.
struct BufferingLogger {
    inner: Box<dyn Log>,
    level: Level,
    buffer: Buffer,
}

impl Log for BufferingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.inner.enabled(record.metadata()) {
            self.inner.log(record);
        }
        if record.level() > self.level {
            return;
        }
        let line = format!("[{}] {}: {}", record.level(), record.target(), record.args());
        let mut buffer = self.buffer.lock().expect("log buffer poisoned");
        buffer.push(line);
        if buffer.len() > MAX_BUFFERED_LINES {
            let overflow = buffer.len() - MAX_BUFFERED_LINES;
            buffer.drain(0..overflow);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// A cloneable handle onto the installed logger's buffer, held by the
/// draining thread.
#[derive(Clone)]
pub struct LogBufferHandle(Buffer);

impl LogBufferHandle {
    fn drain(&self) -> Vec<String> {
        let mut buffer = self.0.lock().expect("log buffer poisoned");
        std::mem::take(&mut *buffer)
    }
}

/// Installs a buffering wrapper around `inner` as the process-wide logger.
/// `level` is the forwarding threshold, independent of `inner`'s own filter
/// (so console verbosity and control-forwarding verbosity can differ).
/// Returns the buffer handle the caller hands to [`run`].
pub fn install(inner: Box<dyn Log>, level: Level) -> Result<LogBufferHandle, log::SetLoggerError> {
    let buffer: Buffer = Arc::new(Mutex::new(Vec::new()));
    let handle = LogBufferHandle(buffer.clone());
    log::set_boxed_logger(Box::new(BufferingLogger { inner, level, buffer }))?;
    Ok(handle)
}

/// Runs on its own thread until `exiting` is set, draining the buffer and
/// pushing it to control every `interval`. A non-empty buffer at exit is
/// flushed once more before returning.
pub fn run(buffer: LogBufferHandle, client: ControlClient, interval: Duration, exiting: Arc<AtomicBool>) {
    loop {
        let done = exiting.load(Ordering::SeqCst);
        let lines = buffer.drain();
        if !lines.is_empty() {
            client.push_logs(lines);
        }
        if done {
            return;
        }
        std::thread::sleep(interval);
    }
}
