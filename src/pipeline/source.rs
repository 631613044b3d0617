//! Device-file backed source pipeline
//!
//! Reads muxed encoder output from the hardware encoder device nodes,
//! stamps each block with its media duration and feeds the bounded queue.
//! Capture pause/resume gates the readers without closing the devices,
//! mirroring how the hardware keeps encoding while delivery is halted.

use bytes::Bytes;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::element::{ElementCaps, InputMode, SourceElement};
use super::queue::{MediaBuffer, StreamQueue};
use super::{MediaPipeline, PipelineFault};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

use async_trait::async_trait;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RunState {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

/// Per-element mutable state
#[derive(Debug, Clone)]
struct ElementState {
    device: Option<PathBuf>,
    /// Encoder bitrate in kbit/s
    bitrate: u32,
    input_mode: InputMode,
}

struct PipelineState {
    run_state: RunState,
    audio: ElementState,
    video: ElementState,
    caps: ElementCaps,
}

/// Pipeline construction parameters
#[derive(Debug, Clone)]
pub struct EncoderPipelineConfig {
    pub audio_device: Option<PathBuf>,
    pub video_device: Option<PathBuf>,
    pub audio_bitrate: u32,
    pub video_bitrate: u32,
    pub caps: ElementCaps,
    pub input_mode: InputMode,
    /// Capture read block size in bytes
    pub block_size: usize,
    /// Queue bound in media duration
    pub queue_max: Duration,
}

impl Default for EncoderPipelineConfig {
    fn default() -> Self {
        Self {
            audio_device: None,
            video_device: None,
            audio_bitrate: 128,
            video_bitrate: 2500,
            caps: ElementCaps::default(),
            input_mode: InputMode::Live,
            block_size: 32768,
            queue_max: Duration::from_secs(5),
        }
    }
}

/// Device-file backed pipeline implementation
pub struct EncoderPipeline {
    queue: Arc<StreamQueue>,
    events: Arc<EventBus>,
    fault_tx: mpsc::UnboundedSender<PipelineFault>,
    state: RwLock<PipelineState>,
    paused_tx: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    block_size: usize,
    throttler: LogThrottler,
}

impl EncoderPipeline {
    pub fn new(
        config: EncoderPipelineConfig,
        events: Arc<EventBus>,
        fault_tx: mpsc::UnboundedSender<PipelineFault>,
    ) -> Self {
        let (paused_tx, _) = watch::channel(true);
        Self {
            queue: Arc::new(StreamQueue::new(config.queue_max)),
            events,
            fault_tx,
            state: RwLock::new(PipelineState {
                run_state: RunState::Null,
                audio: ElementState {
                    device: config.audio_device,
                    bitrate: config.audio_bitrate,
                    input_mode: config.input_mode,
                },
                video: ElementState {
                    device: config.video_device,
                    bitrate: config.video_bitrate,
                    input_mode: config.input_mode,
                },
                caps: config.caps,
            }),
            paused_tx,
            cancel: Mutex::new(CancellationToken::new()),
            block_size: config.block_size,
            throttler: LogThrottler::default(),
        }
    }

    fn element_state(&self, element: SourceElement) -> ElementState {
        let state = self.state.read();
        match element {
            SourceElement::Audio => state.audio.clone(),
            SourceElement::Video => state.video.clone(),
        }
    }

    async fn spawn_capture(&self, element: SourceElement, cancel: CancellationToken) -> Result<()> {
        let elem = self.element_state(element);
        let Some(path) = elem.device else {
            debug!("no {element} encoder device configured, skipping capture");
            return Ok(());
        };

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            AppError::Pipeline(format!("cannot open {element} encoder {path:?}: {e}"))
        })?;

        let queue = self.queue.clone();
        let fault_tx = self.fault_tx.clone();
        let mut paused_rx = self.paused_tx.subscribe();
        let block_size = self.block_size;
        let bitrate = elem.bitrate.max(1);

        info!("capture task started for {element} encoder {path:?}");

        tokio::spawn(async move {
            let mut block = vec![0u8; block_size];
            loop {
                // Hold while capture is paused
                while *paused_rx.borrow() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = paused_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }

                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = file.read(&mut block) => r,
                };

                match read {
                    Ok(0) => {
                        info!("{element} encoder reached end of stream");
                        let _ = fault_tx.send(PipelineFault::EndOfStream);
                        return;
                    }
                    Ok(n) => {
                        // Media duration of this block at the current encoder rate:
                        // n bytes * 8 bits / kbit/s = milliseconds
                        let millis = (n as u64 * 8) / bitrate as u64;
                        let buf = MediaBuffer::new(
                            Bytes::copy_from_slice(&block[..n]),
                            Duration::from_millis(millis.max(1)),
                        );
                        if !queue.push(buf).await {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = fault_tx.send(PipelineFault::EncoderRead {
                            element,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl MediaPipeline for EncoderPipeline {
    async fn set_ready(&self) -> Result<()> {
        self.state.write().run_state = RunState::Ready;
        self.events.publish(SystemEvent::SourceReady);
        Ok(())
    }

    async fn set_active(&self, timeout: Duration) -> Result<()> {
        {
            let state = self.state.read();
            if state.run_state == RunState::Playing {
                return Ok(());
            }
            if state.run_state == RunState::Null {
                return Err(AppError::Pipeline("pipeline not created".to_string()));
            }
        }

        let cancel = {
            let guard = self.cancel.lock().await;
            guard.clone()
        };

        // Opening the encoder devices is the only part that can stall
        let spawn_all = async {
            self.spawn_capture(SourceElement::Audio, cancel.clone())
                .await?;
            self.spawn_capture(SourceElement::Video, cancel.clone())
                .await?;
            Ok::<(), AppError>(())
        };
        match tokio::time::timeout(timeout, spawn_all).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Pipeline(
                    "timed out waiting for active state".to_string(),
                ))
            }
        }

        let _ = self.paused_tx.send(false);
        self.state.write().run_state = RunState::Playing;
        info!("pipeline active");
        Ok(())
    }

    async fn set_paused(&self) -> Result<()> {
        let _ = self.paused_tx.send(true);
        self.state.write().run_state = RunState::Paused;
        debug!("pipeline paused");
        Ok(())
    }

    async fn destroy(&self) {
        {
            let guard = self.cancel.lock().await;
            guard.cancel();
        }
        let _ = self.paused_tx.send(true);
        self.queue.close();
        self.state.write().run_state = RunState::Null;
        info!("pipeline destroyed");
    }

    async fn recreate(&self) -> Result<()> {
        {
            let mut guard = self.cancel.lock().await;
            guard.cancel();
            *guard = CancellationToken::new();
        }
        let _ = self.paused_tx.send(true);
        self.queue.reopen();
        self.set_ready().await?;
        info!("pipeline recreated");
        Ok(())
    }

    async fn pause_sources(&self) -> Result<()> {
        if self.state.read().run_state == RunState::Null {
            return Err(AppError::Pipeline("pipeline not created".to_string()));
        }
        let _ = self.paused_tx.send(true);
        debug!("encoder sources paused");
        Ok(())
    }

    async fn resume_sources(&self) -> Result<()> {
        if self.state.read().run_state == RunState::Null {
            warn_throttled!(
                self.throttler,
                "resume_no_pipeline",
                "cannot resume sources without a pipeline"
            );
            return Err(AppError::Pipeline("pipeline not created".to_string()));
        }
        let _ = self.paused_tx.send(false);
        debug!("encoder sources resumed");
        Ok(())
    }

    fn bitrate(&self, element: SourceElement) -> Option<u32> {
        let state = self.state.read();
        if state.run_state == RunState::Null {
            return None;
        }
        Some(match element {
            SourceElement::Audio => state.audio.bitrate,
            SourceElement::Video => state.video.bitrate,
        })
    }

    fn set_bitrate(&self, element: SourceElement, kbit: u32) {
        let mut state = self.state.write();
        match element {
            SourceElement::Audio => state.audio.bitrate = kbit,
            SourceElement::Video => state.video.bitrate = kbit,
        }
    }

    fn caps(&self) -> Option<ElementCaps> {
        let state = self.state.read();
        if state.run_state == RunState::Null {
            return None;
        }
        Some(state.caps)
    }

    fn set_caps(&self, caps: ElementCaps) {
        self.state.write().caps = caps;
    }

    fn input_mode(&self) -> Option<InputMode> {
        let state = self.state.read();
        if state.run_state == RunState::Null {
            return None;
        }
        if state.audio.input_mode == state.video.input_mode {
            Some(state.audio.input_mode)
        } else {
            None
        }
    }

    fn set_input_mode(&self, mode: InputMode) {
        let mut state = self.state.write();
        state.audio.input_mode = mode;
        state.video.input_mode = mode;
    }

    fn queue(&self) -> Arc<StreamQueue> {
        self.queue.clone()
    }
}
