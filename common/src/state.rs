use serde::Serialize;
use std::fmt;

use crate::classification::{ClassificationResult, DetectedObject, ThreatLevel};

/// Failure taxonomy surfaced to observers. Never terminates the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Permission denied, no device, or the device went away mid-session.
    DeviceUnavailable,
    /// The request could not be sent, or it timed out.
    NetworkUnreachable,
    /// Non-2xx status or an unusable response body.
    BackendError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::DeviceUnavailable => "device unavailable",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::BackendError => "backend error",
        })
    }
}

/// Everything an observer needs to render the HUD.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopState {
    pub enabled: bool,
    pub last_result: Option<ClassificationResult>,
    pub last_error: Option<ErrorKind>,
    /// Unix millis at which `last_result` was applied.
    pub last_result_at_ms: Option<i64>,
}

impl LoopState {
    /// State after a device could not be acquired or was lost.
    pub fn offline() -> Self {
        Self {
            last_error: Some(ErrorKind::DeviceUnavailable),
            ..Self::default()
        }
    }

    pub fn view(&self) -> HudView {
        HudView::from(self)
    }
}

/// What the display should show, derived from [`LoopState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HudView {
    /// Explicit "sensor offline" affordance.
    Offline,
    /// Capture switched off by the operator.
    Standby,
    /// Capturing, no classification received yet.
    Scanning,
    Tracking {
        threat: ThreatLevel,
        label: String,
        objects: Vec<DetectedObject>,
        /// The last request failed; this is the last good reading.
        stale: bool,
    },
}

impl From<&LoopState> for HudView {
    fn from(state: &LoopState) -> Self {
        if !state.enabled {
            return match state.last_error {
                Some(ErrorKind::DeviceUnavailable) => HudView::Offline,
                _ => HudView::Standby,
            };
        }
        match &state.last_result {
            None => HudView::Scanning,
            Some(result) => HudView::Tracking {
                threat: result.threat_level,
                label: result.label.clone(),
                objects: result.objects.clone(),
                stale: state.last_error.is_some(),
            },
        }
    }
}
