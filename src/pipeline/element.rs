//! Encoder element identifiers, input modes and capability descriptions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two hardware encoder elements feeding the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceElement {
    Audio,
    Video,
}

impl fmt::Display for SourceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceElement::Audio => write!(f, "audio"),
            SourceElement::Video => write!(f, "video"),
        }
    }
}

/// Encoder input selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Live,
    Hdmi,
    Background,
}

impl InputMode {
    /// Numeric encoding used on the control-plane wire
    pub fn as_i32(self) -> i32 {
        match self {
            InputMode::Live => 0,
            InputMode::Hdmi => 1,
            InputMode::Background => 2,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(InputMode::Live),
            1 => Some(InputMode::Hdmi),
            2 => Some(InputMode::Background),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputMode::Live => "live",
            InputMode::Hdmi => "hdmi",
            InputMode::Background => "background",
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(InputMode::Live),
            "hdmi" => Ok(InputMode::Hdmi),
            "background" => Ok(InputMode::Background),
            other => Err(format!("unknown input mode '{other}'")),
        }
    }
}

/// Capability description of the video encoder element
///
/// A field value of 0 means the constraint is cleared (the encoder picks).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCaps {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl ElementCaps {
    pub fn new(width: u32, height: u32, framerate: u32) -> Self {
        Self {
            width,
            height,
            framerate,
        }
    }
}
