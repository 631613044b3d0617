//! TCP transport sink: the outbound half of the upstream connection.
//!
//! A sink is connected before the flow-control engine commits to the
//! enabled state. Teardown cancels the writer task and joins it; the
//! writer observes cancellation between buffers and also while blocked in
//! a write, in which case the connection is simply abandoned — the peer
//! is going away regardless. A buffer is never cut short on a connection
//! that keeps living: a bounded lateness budget drops a buffer wholesale
//! before its first byte, and a stall after the first byte is a transport
//! fault that ends the connection.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BitrateMonitor, TOKEN_LEN};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::pipeline::{PipelineFault, StreamQueue};
use crate::utils::LogThrottler;
use crate::warn_throttled;

pub struct TransportSink {
    host: String,
    port: u16,
    token: Option<[u8; TOKEN_LEN]>,
    stream: Mutex<Option<TcpStream>>,
    lateness_tx: watch::Sender<Option<Duration>>,
    /// Generation of an armed one-shot data-flow probe
    flow_probe: Arc<Mutex<Option<u64>>>,
    cancel: CancellationToken,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransportSink {
    /// Establish the TCP connection. Nothing is written until the sink is
    /// attached to a queue.
    pub async fn connect(host: &str, port: u16, token: Option<&str>) -> Result<Self> {
        let token = match token {
            Some(t) if !t.is_empty() => {
                if t.len() > TOKEN_LEN {
                    return Err(AppError::BadRequest(format!(
                        "token longer than {TOKEN_LEN} bytes"
                    )));
                }
                let mut buf = [0u8; TOKEN_LEN];
                buf[..t.len()].copy_from_slice(t.as_bytes());
                Some(buf)
            }
            _ => None,
        };

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| AppError::Transport {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| AppError::Transport {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        info!("connected to collector at {host}:{port}");

        let (lateness_tx, _) = watch::channel(None);
        Ok(Self {
            host: host.to_string(),
            port,
            token,
            stream: Mutex::new(Some(stream)),
            lateness_tx,
            flow_probe: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            writer: tokio::sync::Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the writer task draining `queue` into the socket. The token,
    /// when present, is the first thing on the wire.
    pub async fn attach(
        &self,
        queue: Arc<StreamQueue>,
        monitor: Arc<BitrateMonitor>,
        events: Arc<EventBus>,
        fault_tx: mpsc::UnboundedSender<PipelineFault>,
        flow_tx: mpsc::UnboundedSender<u64>,
    ) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| AppError::Upstream("sink already attached".to_string()))?;

        let handle = tokio::spawn(writer_loop(WriterContext {
            stream,
            token: self.token,
            queue,
            monitor,
            events,
            fault_tx,
            flow_tx,
            flow_probe: self.flow_probe.clone(),
            lateness_rx: self.lateness_tx.subscribe(),
            cancel: self.cancel.clone(),
            peer: format!("{}:{}", self.host, self.port),
        }));
        *self.writer.lock().await = Some(handle);
        Ok(())
    }

    /// Per-buffer delivery budget. `None` means unlimited; under a bounded
    /// budget a buffer whose first byte cannot go out in time is dropped
    /// whole, and a buffer stalling mid-write is a transport fault.
    pub fn set_lateness(&self, budget: Option<Duration>) {
        let _ = self.lateness_tx.send(budget);
    }

    /// Arm a one-shot probe that reports the given generation on the next
    /// buffer successfully written.
    pub fn arm_flow_probe(&self, generation: u64) {
        *self.flow_probe.lock() = Some(generation);
    }

    pub fn clear_flow_probe(&self) {
        *self.flow_probe.lock() = None;
    }

    /// Stop the writer and wait for it to finish. A write in flight is
    /// abandoned along with the connection. After this returns nothing
    /// references the socket.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("transport sink to {}:{} shut down", self.host, self.port);
    }
}

struct WriterContext {
    stream: TcpStream,
    token: Option<[u8; TOKEN_LEN]>,
    queue: Arc<StreamQueue>,
    monitor: Arc<BitrateMonitor>,
    events: Arc<EventBus>,
    fault_tx: mpsc::UnboundedSender<PipelineFault>,
    flow_tx: mpsc::UnboundedSender<u64>,
    flow_probe: Arc<Mutex<Option<u64>>>,
    lateness_rx: watch::Receiver<Option<Duration>>,
    cancel: CancellationToken,
    peer: String,
}

#[derive(Debug)]
enum WriteOutcome {
    Delivered,
    /// Bounded budget expired before the first byte went out
    DroppedLate,
    /// Bounded budget expired with the buffer partially on the wire; the
    /// connection cannot carry the next buffer without corrupting the mux
    Stalled { written: usize },
    Failed(std::io::Error),
}

/// Write one buffer, honoring the delivery budget without ever leaving a
/// partial prefix followed by another buffer on a surviving connection.
async fn write_buffer(
    stream: &mut TcpStream,
    data: &[u8],
    budget: Option<Duration>,
) -> WriteOutcome {
    let Some(limit) = budget else {
        return match stream.write_all(data).await {
            Ok(()) => WriteOutcome::Delivered,
            Err(e) => WriteOutcome::Failed(e),
        };
    };

    let deadline = tokio::time::Instant::now() + limit;
    let mut written = 0usize;
    while written < data.len() {
        match tokio::time::timeout_at(deadline, stream.write(&data[written..])).await {
            Ok(Ok(0)) => {
                return WriteOutcome::Failed(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection closed by peer",
                ))
            }
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => return WriteOutcome::Failed(e),
            Err(_) if written == 0 => return WriteOutcome::DroppedLate,
            Err(_) => return WriteOutcome::Stalled { written },
        }
    }
    WriteOutcome::Delivered
}

async fn writer_loop(mut ctx: WriterContext) {
    if let Some(token) = ctx.token {
        let sent = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = ctx.stream.write_all(&token) => result,
        };
        if let Err(e) = sent {
            let _ = ctx.fault_tx.send(PipelineFault::TransportWrite {
                reason: format!("{}: token write failed: {e}", ctx.peer),
            });
            return;
        }
        debug!("authorization token sent to {}", ctx.peer);
    }

    let throttler = LogThrottler::default();
    loop {
        let buf = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            buf = ctx.queue.pop() => match buf {
                Some(buf) => buf,
                None => break,
            },
        };

        let budget = *ctx.lateness_rx.borrow();
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("teardown while writing to {}, abandoning connection", ctx.peer);
                return;
            }
            outcome = write_buffer(&mut ctx.stream, &buf.data, budget) => outcome,
        };

        match outcome {
            WriteOutcome::Delivered => {
                if let Some(generation) = ctx.flow_probe.lock().take() {
                    let _ = ctx.flow_tx.send(generation);
                }
                if let Some(kbit) = ctx.monitor.record(buf.len()) {
                    ctx.events.publish(SystemEvent::TcpBitrate {
                        kbit_per_sec: kbit as i32,
                    });
                }
            }
            WriteOutcome::DroppedLate => {
                warn_throttled!(
                    throttler,
                    "late_buffer",
                    "dropping buffer late beyond {budget:?} on {}",
                    ctx.peer
                );
            }
            WriteOutcome::Stalled { written } => {
                let _ = ctx.fault_tx.send(PipelineFault::TransportWrite {
                    reason: format!(
                        "{}: buffer stalled after {written} of {} bytes",
                        ctx.peer,
                        buf.len()
                    ),
                });
                return;
            }
            WriteOutcome::Failed(e) => {
                let _ = ctx.fault_tx.send(PipelineFault::TransportWrite {
                    reason: format!("{}: {e}", ctx.peer),
                });
                return;
            }
        }
    }
    debug!("transport writer to {} stopped", ctx.peer);
}
