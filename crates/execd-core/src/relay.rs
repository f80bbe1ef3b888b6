//! Log relay: retained output plus live streaming per execution
//!
//! The runtime pushes lines into a `LogSink` while the container runs; every
//! line is retained, so a consumer that connects late still sees the stream
//! from the beginning. When the execution terminates the buffer is closed and
//! all streams become finite. Re-invoking `stream` after termination replays
//! the retained output.

use async_stream::stream;
use futures_util::Stream;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BufferState {
    lines: Vec<String>,
    closed: bool,
}

/// Retained log output of one execution.
#[derive(Debug, Default)]
pub struct LogBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one line. Lines pushed after close are dropped.
    pub fn push(&self, line: String) {
        let mut state = self.state.lock().expect("log buffer poisoned");
        if state.closed {
            return;
        }
        state.lines.push(line);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Mark the stream finite. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("log buffer poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("log buffer poisoned").closed
    }

    /// Copy of everything retained so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.state.lock().expect("log buffer poisoned").lines.clone()
    }

    fn read_from(&self, cursor: usize) -> (Vec<String>, bool) {
        let state = self.state.lock().expect("log buffer poisoned");
        (state.lines[cursor.min(state.lines.len())..].to_vec(), state.closed)
    }
}

/// Producer handle handed to the launcher's log pump.
#[derive(Debug, Clone)]
pub struct LogSink(Arc<LogBuffer>);

impl LogSink {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self(buffer)
    }

    pub fn push(&self, line: impl Into<String>) {
        self.0.push(line.into());
    }
}

/// Lazy sequence of log lines, from the first retained line onward.
///
/// Blocks only its own consumer while the execution is live; finite once the
/// buffer closes.
pub fn stream_lines(buffer: Arc<LogBuffer>) -> impl Stream<Item = String> {
    stream! {
        let mut cursor = 0usize;
        loop {
            // Arm the notification before draining so a push between the
            // drain and the await cannot be missed.
            let notified = buffer.notify.notified();
            let (lines, closed) = buffer.read_from(cursor);
            cursor += lines.len();
            for line in lines {
                yield line;
            }
            if closed {
                break;
            }
            notified.await;
        }
    }
}
