//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// System event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "upstream.state_changed",
///   "data": { "state": 3 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Upstream flow-control state changed
    ///
    /// `state` carries the numeric encoding of `UpstreamState` so control
    /// clients built against the original wire contract keep working.
    #[serde(rename = "upstream.state_changed")]
    UpstreamStateChanged {
        /// 0=disabled 1=connecting 2=waiting 3=transmitting 4=overload
        state: i32,
    },

    /// Measured outbound transport bitrate (kbit/s, 0 when not transmitting)
    #[serde(rename = "upstream.tcp_bitrate")]
    TcpBitrate { kbit_per_sec: i32 },

    /// Source pipeline reached its ready state
    #[serde(rename = "source.ready")]
    SourceReady,

    /// A hardware encoder element failed to deliver data
    #[serde(rename = "source.encoder_error")]
    EncoderError {
        /// Element that failed: "audio", "video"
        element: String,
    },

    /// System error or warning
    #[serde(rename = "system.error")]
    SystemError {
        /// Module that generated the error: "upstream", "pipeline", "control"
        module: String,
        /// Severity: "warning", "error", "critical"
        severity: String,
        /// Error message
        message: String,
    },

    /// WebSocket error notification (for connection-level errors like lag)
    #[serde(rename = "error")]
    Error {
        /// Error message
        message: String,
    },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UpstreamStateChanged { .. } => "upstream.state_changed",
            Self::TcpBitrate { .. } => "upstream.tcp_bitrate",
            Self::SourceReady => "source.ready",
            Self::EncoderError { .. } => "source.encoder_error",
            Self::SystemError { .. } => "system.error",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `upstream.*` matches all upstream events
    /// - `upstream.state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
