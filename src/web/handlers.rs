//! Control-plane request handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::pipeline::{InputMode, SourceElement};
use crate::state::AppState;

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let upstream_state = state.upstream.state();
    let caps = state.pipeline.caps().unwrap_or_default();
    Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": {
            "state": upstream_state.as_i32(),
            "state_name": upstream_state.to_string(),
            "auto_bitrate": state.upstream.auto_bitrate(),
            "measured_kbit": state.upstream.measured_bitrate(),
        },
        "source": {
            "audio_bitrate": state.pipeline.bitrate(SourceElement::Audio).unwrap_or(0),
            "video_bitrate": state.pipeline.bitrate(SourceElement::Video).unwrap_or(0),
            "width": caps.width,
            "height": caps.height,
            "framerate": caps.framerate,
            "input_mode": state.pipeline.input_mode().map(|m| m.to_string()),
        },
    }))
}

// ============================================================================
// Upstream control
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UpstreamRequest {
    pub enable: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Enable or disable the upstream delivery. Disabling recreates the source
/// pipeline so devices come back in a clean state.
pub async fn set_upstream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpstreamRequest>,
) -> Result<Json<Value>> {
    if req.enable {
        let host = req
            .host
            .ok_or_else(|| AppError::BadRequest("host is required to enable".to_string()))?;
        let port = req
            .port
            .ok_or_else(|| AppError::BadRequest("port is required to enable".to_string()))?;
        info!("upstream enable requested towards {host}:{port}");
        state
            .upstream
            .enable(&host, port, req.token.as_deref())
            .await?;
    } else {
        info!("upstream disable requested");
        state.upstream.disable().await?;
        state.pipeline.recreate().await?;
        state.upstream.properties().apply();
    }
    Ok(Json(json!({
        "success": true,
        "state": state.upstream.state().as_i32(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResolutionRequest {
    pub width: u32,
    pub height: u32,
}

pub async fn set_resolution(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolutionRequest>,
) -> Result<Json<Value>> {
    state
        .upstream
        .properties()
        .set_resolution(req.width, req.height)?;
    state
        .config
        .update(|c| {
            c.source.width = req.width;
            c.source.height = req.height;
        })
        .await?;
    info!("resolution set to {}x{}", req.width, req.height);
    Ok(Json(json!({ "success": true })))
}

// ============================================================================
// Properties
// ============================================================================

/// Control-plane property names. Every property access is dispatched
/// through this enum so unknown names fail in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlProperty {
    UpstreamState,
    InputMode,
    AudioBitrate,
    VideoBitrate,
    Width,
    Height,
    Framerate,
    AutoBitrate,
    Clients,
}

impl FromStr for ControlProperty {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upstreamState" => Ok(Self::UpstreamState),
            "inputMode" => Ok(Self::InputMode),
            "audioBitrate" => Ok(Self::AudioBitrate),
            "videoBitrate" => Ok(Self::VideoBitrate),
            "width" => Ok(Self::Width),
            "height" => Ok(Self::Height),
            "framerate" => Ok(Self::Framerate),
            "autoBitrate" => Ok(Self::AutoBitrate),
            "clients" => Ok(Self::Clients),
            other => Err(AppError::NotFound(format!("unknown property '{other}'"))),
        }
    }
}

pub async fn get_property(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let property: ControlProperty = name.parse()?;
    let caps = state.pipeline.caps().unwrap_or_default();
    let value = match property {
        ControlProperty::UpstreamState => json!(state.upstream.state().as_i32()),
        ControlProperty::InputMode => {
            let mode = state.pipeline.input_mode().ok_or_else(|| {
                AppError::Pipeline("input mode unavailable, pipeline not created".to_string())
            })?;
            json!(mode.as_i32())
        }
        ControlProperty::AudioBitrate => {
            json!(state.pipeline.bitrate(SourceElement::Audio).unwrap_or(0))
        }
        ControlProperty::VideoBitrate => {
            json!(state.pipeline.bitrate(SourceElement::Video).unwrap_or(0))
        }
        ControlProperty::Width => json!(caps.width),
        ControlProperty::Height => json!(caps.height),
        ControlProperty::Framerate => json!(caps.framerate),
        ControlProperty::AutoBitrate => json!(state.upstream.auto_bitrate()),
        // This daemon serves exactly one collector
        ControlProperty::Clients => json!(0),
    };
    Ok(Json(json!({
        "success": true,
        "name": name,
        "value": value,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PropertyRequest {
    pub value: Value,
}

pub async fn put_property(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<PropertyRequest>,
) -> Result<Json<Value>> {
    let property: ControlProperty = name.parse()?;
    match property {
        ControlProperty::UpstreamState => {
            return Err(AppError::BadRequest(
                "upstreamState is read-only, use /api/upstream".to_string(),
            ))
        }
        ControlProperty::Clients => {
            return Err(AppError::BadRequest("clients is read-only".to_string()))
        }
        ControlProperty::Width | ControlProperty::Height => {
            return Err(AppError::BadRequest(
                "width/height are set together through /api/resolution".to_string(),
            ))
        }
        ControlProperty::AutoBitrate => {
            let enabled = req
                .value
                .as_bool()
                .ok_or_else(|| AppError::BadRequest("autoBitrate wants a boolean".to_string()))?;
            state.upstream.set_auto_bitrate(enabled);
            state
                .config
                .update(|c| c.upstream.auto_bitrate = enabled)
                .await?;
            info!("auto bitrate {}", if enabled { "enabled" } else { "disabled" });
        }
        ControlProperty::AudioBitrate => {
            let kbit = numeric(&req.value, "audioBitrate")?;
            state
                .upstream
                .properties()
                .set_bitrate(SourceElement::Audio, kbit)?;
            state
                .config
                .update(|c| c.source.audio_bitrate = kbit)
                .await?;
        }
        ControlProperty::VideoBitrate => {
            let kbit = numeric(&req.value, "videoBitrate")?;
            state
                .upstream
                .properties()
                .set_bitrate(SourceElement::Video, kbit)?;
            state
                .config
                .update(|c| c.source.video_bitrate = kbit)
                .await?;
        }
        ControlProperty::Framerate => {
            let fps = numeric(&req.value, "framerate")?;
            state.upstream.properties().set_framerate(fps)?;
            state.config.update(|c| c.source.framerate = fps).await?;
        }
        ControlProperty::InputMode => {
            let mode = parse_input_mode(&req.value)?;
            state.pipeline.set_input_mode(mode);
            if state.pipeline.input_mode() != Some(mode) {
                warn!("input mode did not apply to both encoder elements");
                return Err(AppError::Config(
                    "input mode did not apply to both encoder elements".to_string(),
                ));
            }
            state
                .config
                .update(|c| c.source.input_mode = mode.as_str().to_string())
                .await?;
            info!("input mode set to {mode}");
        }
    }
    Ok(Json(json!({ "success": true, "name": name })))
}

fn numeric(value: &Value, name: &str) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| AppError::BadRequest(format!("{name} wants an unsigned integer")))
}

/// Input mode arrives either as its wire number or as its name.
fn parse_input_mode(value: &Value) -> Result<InputMode> {
    if let Some(n) = value.as_i64() {
        let n = i32::try_from(n)
            .map_err(|_| AppError::BadRequest("input mode out of range".to_string()))?;
        return InputMode::from_i32(n)
            .ok_or_else(|| AppError::BadRequest(format!("unknown input mode {n}")));
    }
    if let Some(s) = value.as_str() {
        return s.parse().map_err(AppError::BadRequest);
    }
    Err(AppError::BadRequest(
        "inputMode wants a number or a name".to_string(),
    ))
}
