//! The cross-thread frame queue.
//!
//! Producers (encoder callbacks) append frames; the single sender thread
//! drains them in FIFO order. A condition variable carries both
//! "frame available" and out-of-band wakeups (metadata became ready,
//! shutdown requested), so the sender can park without polling.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use livepush_transport::AvFrame;

struct QueueInner {
    frames: VecDeque<AvFrame>,
    shutdown: bool,
}

/// FIFO queue of encoded frames with shutdown signaling.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append a frame and wake the sender. Dropped when shut down.
    pub fn push(&self, frame: AvFrame) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            trace!("queue shut down, dropping frame");
            return;
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.ready.notify_one();
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Wake every waiter without enqueuing anything (metadata gating).
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    /// Mark the queue as shut down and wake every waiter.
    ///
    /// Frames already queued still drain through [`pop_wait`](Self::pop_wait).
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.ready.notify_all();
    }

    /// Clear queued frames and reopen the queue for a new run.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.shutdown = false;
    }

    /// Block until a frame is available; `None` once the queue is shut
    /// down and drained.
    pub fn pop_wait(&self) -> Option<AvFrame> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            if inner.shutdown {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Park for up to `timeout` waiting for any wakeup. Used by the sender
    /// while metadata is not yet initialized.
    pub fn wait_wakeup(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        self.ready.wait_for(&mut inner, timeout);
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
