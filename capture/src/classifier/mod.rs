pub mod http;

use std::future::Future;

use threat_hud_common::classification::{ClassificationResult, ResponseError};
use threat_hud_common::frame::EncodedImage;
use threat_hud_common::state::ErrorKind;

pub use http::HttpClassifier;

/// Remote inference backend as seen by the capture loop.
pub trait Classifier: Send + Sync + 'static {
    fn classify(
        &self,
        image: EncodedImage,
    ) -> impl Future<Output = Result<ClassificationResult, ClassifyError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP status {0}")]
    Status(u16),
    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl ClassifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassifyError::Client(_) | ClassifyError::Unreachable(_) | ClassifyError::Timeout => {
                ErrorKind::NetworkUnreachable
            }
            ClassifyError::Status(_) | ClassifyError::Response(_) => ErrorKind::BackendError,
        }
    }
}
