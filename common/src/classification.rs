use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label shown when the backend saw nothing worth naming.
pub const SCANNING_LABEL: &str = "SCANNING...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    Safe,
    Caution,
    Danger,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Safe => "SAFE",
            ThreatLevel::Caution => "CAUTION",
            ThreatLevel::Danger => "DANGER",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLevel {
    type Err = ResponseError;

    /// Exact match only; the backend contract uses upper-case names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAFE" => Ok(ThreatLevel::Safe),
            "CAUTION" => Ok(ThreatLevel::Caution),
            "DANGER" => Ok(ThreatLevel::Danger),
            other => Err(ResponseError::UnknownThreat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
}

/// One classification from the backend. Replaces the previous result wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub threat_level: ThreatLevel,
    pub label: String,
    pub objects: Vec<DetectedObject>,
}

/// Body of `POST /analyze`.
#[derive(Debug, Serialize)]
pub struct AnalyzeRequest<'a> {
    pub image: &'a str,
}

/// Raw response shape. Everything is optional here so that validation can
/// report exactly what was wrong.
#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    threat: Option<String>,
    label: Option<String>,
    #[serde(default)]
    objects: Option<Vec<DetectedObject>>,
    #[allow(dead_code)]
    count: Option<u64>,
    error: Option<String>,
}

/// Response of the backend health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("response is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unrecognized threat level {0:?}")]
    UnknownThreat(String),
    #[error("backend reported an error: {0}")]
    Reported(String),
    #[error("object {class:?} has confidence {confidence} outside [0, 1]")]
    BadConfidence { class: String, confidence: f32 },
}

impl ClassificationResult {
    /// Parse and validate a success-status response body.
    pub fn from_response(body: &[u8]) -> Result<Self, ResponseError> {
        let raw: AnalyzeResponse =
            serde_json::from_slice(body).map_err(|e| ResponseError::Malformed(e.to_string()))?;

        // A 200 carrying `error` is a failed inference, not a SAFE reading.
        if let Some(message) = raw.error {
            return Err(ResponseError::Reported(message));
        }

        let threat_level: ThreatLevel = raw
            .threat
            .as_deref()
            .ok_or(ResponseError::MissingField("threat"))?
            .parse()?;

        let objects = raw.objects.unwrap_or_default();
        for obj in &objects {
            if !obj.confidence.is_finite() || !(0.0..=1.0).contains(&obj.confidence) {
                return Err(ResponseError::BadConfidence {
                    class: obj.class_name.clone(),
                    confidence: obj.confidence,
                });
            }
        }

        let label = match raw.label {
            Some(label) => label,
            None => derive_label(&objects),
        };

        Ok(Self {
            threat_level,
            label,
            objects,
        })
    }
}

/// Label for responses that only carry detections: the most confident class,
/// upper-cased the way the detection backend names its labels.
fn derive_label(objects: &[DetectedObject]) -> String {
    objects
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|obj| obj.class_name.to_uppercase())
        .unwrap_or_else(|| SCANNING_LABEL.to_string())
}
