//! Upstream delivery: TCP transport sink plus the flow-control engine
//! that adapts the encoder to the transport's available bandwidth.

pub mod adjuster;
pub mod controller;
pub mod monitor;
pub mod properties;
pub mod sink;

pub use controller::UpstreamController;
pub use monitor::BitrateMonitor;
pub use properties::{SourceProperties, SourcePropertyCache};
pub use sink::TransportSink;

use std::time::Duration;

/// Overruns tolerated within [`OVERRUN_WINDOW`] before declaring overload
pub const MAX_OVERRUNS: u32 = 3;

/// Sliding window for the overrun counter
pub const OVERRUN_WINDOW: Duration = Duration::from_secs(10);

/// Outbound bitrate averaging period
pub const BITRATE_AVG_PERIOD: Duration = Duration::from_secs(2);

/// Delay before falling back to waiting after an overrun, and before
/// resuming transmission after an overload
pub const RESUME_DELAY: Duration = Duration::from_secs(5);

/// Bounded wait for pipeline state transitions
pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-buffer delivery budget while draining in the waiting state
pub const LATENESS_BUDGET: Duration = Duration::from_secs(1);

/// Fixed length of the authorization token sent after connect
pub const TOKEN_LEN: usize = 36;

/// Audio bitrate is never reduced below this floor (kbit/s)
pub const MIN_AUDIO_KBIT: u32 = 96;

/// Upstream delivery state. The numeric values are part of the control
/// protocol (`upstreamState` property, `upstream.state_changed` events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamState {
    #[default]
    Disabled = 0,
    Connecting = 1,
    Waiting = 2,
    Transmitting = 3,
    Overload = 4,
}

impl UpstreamState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Waiting => "waiting",
            Self::Transmitting => "transmitting",
            Self::Overload => "overload",
        };
        write!(f, "{name}")
    }
}

/// Flow-control bookkeeping guarded by the controller mutex
#[derive(Debug, Clone, Default)]
pub struct FlowCounters {
    /// Overruns seen within the current window
    pub overruns: u32,
    /// Start of the overrun window, `None` while unset
    pub window_start: Option<tokio::time::Instant>,
}

impl FlowCounters {
    pub fn reset(&mut self) {
        self.overruns = 0;
        self.window_start = None;
    }
}
