//! av-uplink - Upstream AV streaming daemon
//!
//! This crate streams muxed audio/video from local hardware encoders to a
//! remote collector over TCP, pausing capture and throttling encoder bitrate
//! when the transport cannot keep up.

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod state;
pub mod upstream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
