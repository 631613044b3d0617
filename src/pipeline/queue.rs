//! Bounded buffering queue between the muxer and the transport sink
//!
//! The queue is bounded by media duration. A producer pushing into a full
//! queue blocks (the queue is not leaky); the depth crossings are reported
//! to the flow controller through a single directional watch: either the
//! overrun edge (queue filled up) or the underrun edge (queue drained
//! empty) is observed, never both at once.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// One muxed media buffer travelling towards the transport sink
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub data: Bytes,
    /// Media duration this buffer represents (drives the queue bound)
    pub duration: Duration,
}

impl MediaBuffer {
    pub fn new(data: Bytes, duration: Duration) -> Self {
        Self { data, duration }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Queue depth event delivered to the flow controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Too much buffered data - the transport cannot keep up
    Overrun,
    /// Queue drained empty - the transport caught up
    Underrun,
}

/// Which depth edge is currently being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWatch {
    Overrun,
    Underrun,
}

struct QueueInner {
    buffers: VecDeque<MediaBuffer>,
    level_bytes: usize,
    level_time: Duration,
    max_time: Duration,
    watch: Option<QueueWatch>,
    event_tx: Option<mpsc::UnboundedSender<QueueEvent>>,
    closed: bool,
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        let wanted = match event {
            QueueEvent::Overrun => QueueWatch::Overrun,
            QueueEvent::Underrun => QueueWatch::Underrun,
        };
        if self.watch == Some(wanted) {
            if let Some(tx) = &self.event_tx {
                let _ = tx.send(event);
            }
        }
    }
}

/// Duration-bounded media queue
pub struct StreamQueue {
    inner: Mutex<QueueInner>,
    /// Signalled when space is freed by a pop
    space: Notify,
    /// Signalled when a buffer arrives
    avail: Notify,
}

impl StreamQueue {
    pub fn new(max_time: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffers: VecDeque::new(),
                level_bytes: 0,
                level_time: Duration::ZERO,
                max_time,
                watch: None,
                event_tx: None,
                closed: false,
            }),
            space: Notify::new(),
            avail: Notify::new(),
        }
    }

    /// Register the channel that receives depth events
    pub fn set_event_sender(&self, tx: mpsc::UnboundedSender<QueueEvent>) {
        self.inner.lock().event_tx = Some(tx);
    }

    /// Select the watched depth edge; `None` disconnects both.
    ///
    /// Exactly one direction is active at a time - switching always
    /// disconnects the other edge first.
    pub fn set_watch(&self, watch: Option<QueueWatch>) {
        self.inner.lock().watch = watch;
    }

    pub fn watch(&self) -> Option<QueueWatch> {
        self.inner.lock().watch
    }

    /// Current buffered media duration
    pub fn level_time(&self) -> Duration {
        self.inner.lock().level_time
    }

    /// Current buffered bytes
    pub fn level_bytes(&self) -> usize {
        self.inner.lock().level_bytes
    }

    /// Append a buffer, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed.
    pub async fn push(&self, buf: MediaBuffer) -> bool {
        loop {
            {
                let mut q = self.inner.lock();
                if q.closed {
                    return false;
                }
                if q.level_time < q.max_time {
                    q.level_bytes += buf.len();
                    q.level_time += buf.duration;
                    q.buffers.push_back(buf);
                    if q.level_time >= q.max_time {
                        q.emit(QueueEvent::Overrun);
                    }
                    self.avail.notify_one();
                    return true;
                }
                // Full: report the backlog, then wait for space
                q.emit(QueueEvent::Overrun);
            }
            self.space.notified().await;
        }
    }

    /// Remove the oldest buffer, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<MediaBuffer> {
        loop {
            {
                let mut q = self.inner.lock();
                if let Some(buf) = q.buffers.pop_front() {
                    q.level_bytes -= buf.len();
                    q.level_time = q.level_time.saturating_sub(buf.duration);
                    if q.buffers.is_empty() {
                        q.emit(QueueEvent::Underrun);
                    }
                    self.space.notify_one();
                    return Some(buf);
                }
                if q.closed {
                    return None;
                }
            }
            self.avail.notified().await;
        }
    }

    /// Drop all buffered data and reset levels, keeping the queue usable
    pub fn flush(&self) {
        let mut q = self.inner.lock();
        q.buffers.clear();
        q.level_bytes = 0;
        q.level_time = Duration::ZERO;
        self.space.notify_one();
    }

    /// Close the queue: producers stop, consumers drain whatever is left
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.avail.notify_waiters();
        self.space.notify_waiters();
    }

    /// Reopen a closed queue (pipeline recreation)
    pub fn reopen(&self) {
        let mut q = self.inner.lock();
        q.closed = false;
        q.buffers.clear();
        q.level_bytes = 0;
        q.level_time = Duration::ZERO;
    }
}
