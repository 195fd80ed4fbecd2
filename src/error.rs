//! Error taxonomy for the prediction pipeline.
//!
//! Every inference-dependent operation fails with exactly one of three kinds.
//! The HTTP layer maps them onto 400 / 503 / 500; the batch orchestrator is
//! the only place that catches them and turns them into per-row entries.

use thiserror::Error;

/// Result alias for pipeline operations.
pub type PredictResult<T> = std::result::Result<T, PredictError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictError {
    /// The caller sent something the pipeline cannot work with
    /// (empty feature vector, malformed CSV, wrong file type).
    #[error("{0}")]
    InvalidInput(String),

    /// No model was loaded at startup.
    #[error("ML model not available")]
    ModelUnavailable,

    /// Scoring or attribution failed after validation passed.
    #[error("Prediction failed: {0}")]
    InferenceError(String),
}

impl PredictError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::InferenceError(msg.into())
    }

    /// Short machine-readable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ModelUnavailable => "model_unavailable",
            Self::InferenceError(_) => "inference_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_cause() {
        let e = PredictError::inference("feature 3 is not finite");
        assert_eq!(e.to_string(), "Prediction failed: feature 3 is not finite");
        assert_eq!(e.kind(), "inference_error");
    }

    #[test]
    fn test_invalid_input_message_is_verbatim() {
        let e = PredictError::invalid("Features array cannot be empty");
        assert_eq!(e.to_string(), "Features array cannot be empty");
        assert_eq!(PredictError::ModelUnavailable.kind(), "model_unavailable");
    }
}
