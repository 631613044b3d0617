//! Media pipeline collaborator
//!
//! The capture/encode path itself is external to the flow-control engine;
//! this module pins down the interface the engine consumes (element
//! property access, capture pause/resume, queue-depth events, lifecycle)
//! and provides `EncoderPipeline`, the device-file backed implementation
//! used by the daemon.

pub mod element;
pub mod queue;
pub mod source;

pub use element::{ElementCaps, InputMode, SourceElement};
pub use queue::{MediaBuffer, QueueEvent, QueueWatch, StreamQueue};
pub use source::{EncoderPipeline, EncoderPipelineConfig};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Data-path fault reported to the supervisor
///
/// The three variants map to distinct recovery policies: encoder read
/// failures kill the pipeline instance without recreation, transport write
/// failures tear down and recreate so capture resumes, end-of-stream ends
/// the process.
#[derive(Debug, Clone)]
pub enum PipelineFault {
    EncoderRead {
        element: SourceElement,
        reason: String,
    },
    TransportWrite {
        reason: String,
    },
    EndOfStream,
}

/// Interface of the media pipeline as consumed by the flow controller
///
/// Implementations must not call back into the controller from within
/// these methods; the controller guarantees it never holds its state lock
/// across them.
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Bring the pipeline to its pre-roll ready state
    async fn set_ready(&self) -> Result<()>;

    /// Drive the pipeline to the active (capturing) state, waiting up to
    /// `timeout` for the transition to complete
    async fn set_active(&self, timeout: Duration) -> Result<()>;

    /// Move the pipeline to the paused state (capture stopped, resources kept)
    async fn set_paused(&self) -> Result<()>;

    /// Tear the pipeline down completely
    async fn destroy(&self);

    /// Rebuild the pipeline after a teardown, back to the ready state
    async fn recreate(&self) -> Result<()>;

    /// Pause only the encoder source elements (the rest keeps draining)
    async fn pause_sources(&self) -> Result<()>;

    /// Resume the encoder source elements
    async fn resume_sources(&self) -> Result<()>;

    /// Current encoder bitrate in kbit/s; `None` when the pipeline is down
    fn bitrate(&self, element: SourceElement) -> Option<u32>;

    /// Write an encoder bitrate. Verification is by reading back.
    fn set_bitrate(&self, element: SourceElement, kbit: u32);

    /// Video capability description; `None` when the pipeline is down
    fn caps(&self) -> Option<ElementCaps>;

    /// Replace the video capability description
    fn set_caps(&self, caps: ElementCaps);

    /// Current input selection of both encoder elements, `None` when they
    /// disagree or the pipeline is down
    fn input_mode(&self) -> Option<InputMode>;

    /// Switch the input selection of both encoder elements
    fn set_input_mode(&self, mode: InputMode);

    /// The bounded queue feeding the transport sink
    fn queue(&self) -> Arc<StreamQueue>;
}
