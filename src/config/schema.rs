use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Control-plane HTTP server settings
    pub control: ControlConfig,
    /// Encoder source settings
    pub source: SourceConfig,
    /// Upstream transport settings
    pub upstream: UpstreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            source: SourceConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

/// Control-plane HTTP/WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8554,
        }
    }
}

/// Encoder source configuration
///
/// Bitrates are in kbit/s, matching the hardware encoder property units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Audio encoder device path (e.g., /dev/aenc0)
    pub audio_device: Option<String>,
    /// Video encoder device path (e.g., /dev/venc0)
    pub video_device: Option<String>,
    /// Initial audio encoder bitrate (kbit/s)
    pub audio_bitrate: u32,
    /// Initial video encoder bitrate (kbit/s)
    pub video_bitrate: u32,
    /// Video width (0 = unconstrained)
    pub width: u32,
    /// Video height (0 = unconstrained)
    pub height: u32,
    /// Frame rate (0 = unconstrained)
    pub framerate: u32,
    /// Input mode: "live", "hdmi", "background"
    pub input_mode: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            audio_device: None,
            video_device: None,
            audio_bitrate: 128,
            video_bitrate: 2500,
            width: 1280,
            height: 720,
            framerate: 25,
            input_mode: "live".to_string(),
        }
    }
}

/// Upstream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Automatically reduce encoder bitrate on sustained overload
    pub auto_bitrate: bool,
    /// Transport write block size in bytes
    pub block_size: usize,
    /// Buffering queue bound in seconds of media
    pub queue_max_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            auto_bitrate: true,
            block_size: 32768,
            queue_max_secs: 5,
        }
    }
}
