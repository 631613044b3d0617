//! Cached view of the encoder source properties.
//!
//! The flow-control engine and the control plane both manipulate encoder
//! settings through this cache so that a destroyed-and-recreated pipeline
//! can be restored to its last known configuration.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::pipeline::{MediaPipeline, SourceElement};

/// Encoder settings snapshot. Bitrates in kbit/s; a zero caps field means
/// the constraint is cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceProperties {
    pub audio_bitrate: u32,
    pub video_bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

pub struct SourcePropertyCache {
    pipeline: Arc<dyn MediaPipeline>,
    cached: Mutex<SourceProperties>,
}

impl SourcePropertyCache {
    pub fn new(pipeline: Arc<dyn MediaPipeline>) -> Self {
        Self {
            pipeline,
            cached: Mutex::new(SourceProperties::default()),
        }
    }

    /// Re-read every property from the pipeline. Values the pipeline cannot
    /// provide read as 0; that is not an error.
    pub fn refresh(&self) -> SourceProperties {
        let caps = self.pipeline.caps().unwrap_or_default();
        let props = SourceProperties {
            audio_bitrate: self.pipeline.bitrate(SourceElement::Audio).unwrap_or(0),
            video_bitrate: self.pipeline.bitrate(SourceElement::Video).unwrap_or(0),
            width: caps.width,
            height: caps.height,
            framerate: caps.framerate,
        };
        *self.cached.lock() = props;
        props
    }

    /// Last refreshed snapshot.
    pub fn cached(&self) -> SourceProperties {
        *self.cached.lock()
    }

    /// Push every non-zero cached value back into the pipeline. Used after
    /// the pipeline has been recreated.
    pub fn apply(&self) {
        let props = self.cached();
        if props.audio_bitrate != 0 {
            self.pipeline
                .set_bitrate(SourceElement::Audio, props.audio_bitrate);
        }
        if props.video_bitrate != 0 {
            self.pipeline
                .set_bitrate(SourceElement::Video, props.video_bitrate);
        }
        let mut caps = self.pipeline.caps().unwrap_or_default();
        if props.width != 0 {
            caps.width = props.width;
        }
        if props.height != 0 {
            caps.height = props.height;
        }
        if props.framerate != 0 {
            caps.framerate = props.framerate;
        }
        self.pipeline.set_caps(caps);
        debug!(?props, "restored cached source properties");
    }

    /// Set one encoder bitrate and verify it by reading it back. The cache
    /// is only updated when the read-back matches.
    pub fn set_bitrate(&self, element: SourceElement, kbit: u32) -> Result<()> {
        if kbit == 0 {
            return Err(AppError::Config(format!(
                "refusing to set {element} bitrate to 0"
            )));
        }
        self.pipeline.set_bitrate(element, kbit);
        match self.pipeline.bitrate(element) {
            Some(applied) if applied == kbit => {
                let mut cached = self.cached.lock();
                match element {
                    SourceElement::Audio => cached.audio_bitrate = kbit,
                    SourceElement::Video => cached.video_bitrate = kbit,
                }
                Ok(())
            }
            Some(applied) => {
                warn!("{element} bitrate read back as {applied}, wanted {kbit}");
                Err(AppError::Config(format!(
                    "{element} bitrate did not apply: wanted {kbit}, got {applied}"
                )))
            }
            None => Err(AppError::Config(format!(
                "{element} bitrate unavailable, pipeline not created"
            ))),
        }
    }

    /// Rewrite only the resolution fields of the caps; 0 clears the
    /// corresponding constraint.
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut caps = self
            .pipeline
            .caps()
            .ok_or_else(|| AppError::Config("caps unavailable, pipeline not created".into()))?;
        caps.width = width;
        caps.height = height;
        self.pipeline.set_caps(caps);
        let mut cached = self.cached.lock();
        cached.width = width;
        cached.height = height;
        Ok(())
    }

    /// Rewrite only the framerate field of the caps; 0 clears the constraint.
    pub fn set_framerate(&self, framerate: u32) -> Result<()> {
        let mut caps = self
            .pipeline
            .caps()
            .ok_or_else(|| AppError::Config("caps unavailable, pipeline not created".into()))?;
        caps.framerate = framerate;
        self.pipeline.set_caps(caps);
        self.cached.lock().framerate = framerate;
        Ok(())
    }
}
