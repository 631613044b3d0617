//! Shared application state and the pipeline fault supervisor.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ConfigStore;
use crate::events::{EventBus, SystemEvent};
use crate::pipeline::{MediaPipeline, PipelineFault};
use crate::upstream::UpstreamController;

/// State shared by the control-plane handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub events: Arc<EventBus>,
    pub pipeline: Arc<dyn MediaPipeline>,
    pub upstream: Arc<UpstreamController>,
}

/// Reacts to faults reported by the data path.
///
/// A transport write failure tears the upstream down and recreates the
/// source pipeline so a later enable starts clean. An encoder read failure
/// is fatal to the pipeline instance: the upstream is disabled and the
/// pipeline destroyed, but nothing is recreated. End of stream requests a
/// daemon shutdown.
pub fn spawn_fault_supervisor(
    state: AppState,
    mut fault_rx: mpsc::UnboundedReceiver<PipelineFault>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fault) = fault_rx.recv().await {
            match fault {
                PipelineFault::TransportWrite { reason } => {
                    error!("transport failure, recovering: {reason}");
                    state.events.publish(SystemEvent::SystemError {
                        module: "upstream".to_string(),
                        severity: "error".to_string(),
                        message: format!("transport write failed: {reason}"),
                    });
                    if let Err(e) = state.upstream.disable().await {
                        error!("disable after transport failure: {e}");
                    }
                    match state.pipeline.recreate().await {
                        Ok(()) => state.upstream.properties().apply(),
                        Err(e) => error!("pipeline recreation failed: {e}"),
                    }
                }
                PipelineFault::EncoderRead { element, reason } => {
                    error!("{element} encoder failed: {reason}");
                    state.events.publish(SystemEvent::EncoderError {
                        element: element.to_string(),
                    });
                    if let Err(e) = state.upstream.disable().await {
                        error!("disable after encoder failure: {e}");
                    }
                    state.pipeline.destroy().await;
                }
                PipelineFault::EndOfStream => {
                    info!("end of stream, shutting down");
                    shutdown.cancel();
                    break;
                }
            }
        }
    })
}
