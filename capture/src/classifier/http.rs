use std::time::Duration;

use threat_hud_common::classification::{
    AnalyzeRequest, BackendHealth, ClassificationResult, ResponseError,
};
use threat_hud_common::config::BackendConfig;
use threat_hud_common::frame::EncodedImage;
use tracing::debug;

use super::{ClassifyError, Classifier};

/// Classifier that POSTs frames to the inference backend's analyze endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    analyze_url: String,
    health_url: String,
}

impl HttpClassifier {
    /// `timeout` bounds every request; a hung backend surfaces as
    /// [`ClassifyError::Timeout`] instead of stalling the loop.
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self, ClassifyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifyError::Client(e.to_string()))?;
        Ok(Self {
            client,
            analyze_url: config.analyze_url(),
            health_url: config.health_url(),
        })
    }

    pub fn analyze_url(&self) -> &str {
        &self.analyze_url
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub async fn health(&self) -> Result<BackendHealth, ClassifyError> {
        let resp = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(ClassifyError::Status(resp.status().as_u16()));
        }
        resp.json::<BackendHealth>().await.map_err(|e| {
            if e.is_decode() {
                ResponseError::Malformed(e.to_string()).into()
            } else {
                transport_error(e)
            }
        })
    }
}

fn transport_error(e: reqwest::Error) -> ClassifyError {
    if e.is_timeout() {
        ClassifyError::Timeout
    } else {
        ClassifyError::Unreachable(e.to_string())
    }
}

impl Classifier for HttpClassifier {
    async fn classify(&self, image: EncodedImage) -> Result<ClassificationResult, ClassifyError> {
        let data_uri = image.to_data_uri();
        debug!(url = self.analyze_url, bytes = image.len(), "sending frame for analysis");

        let resp = self
            .client
            .post(&self.analyze_url)
            .json(&AnalyzeRequest { image: &data_uri })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifyError::Status(status.as_u16()));
        }

        let body = resp.bytes().await.map_err(transport_error)?;
        Ok(ClassificationResult::from_response(&body)?)
    }
}
