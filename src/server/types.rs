//! Request/response types and configuration for the detection server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::batch::RowResult;
use crate::detector::{DetectorConfig, Prediction, DEFAULT_TOP_K};
use crate::error::PredictError;
use crate::features::DEFAULT_EXPECTED_FEATURES;
use crate::mailer::{SmtpSettings, DEFAULT_SMTP_PORT};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default data directory (model artifacts, users, logs, metrics).
pub const DEFAULT_DATA_DIR: &str = "data";

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind to (defaults to 127.0.0.1:8000; use 0.0.0.0 to expose externally)
    pub bind_addr: SocketAddr,
    /// Directory holding label/feature files, users.json and metrics.json.
    pub data_dir: PathBuf,
    /// Tree ensemble artifact. Defaults to `<data_dir>/model.json`.
    pub model_path: Option<PathBuf>,
    /// Input width assumed while no model is loaded.
    pub expected_features: usize,
    /// Attributions reported per prediction.
    pub top_k: usize,
    /// Path for JSONL access log
    pub access_log_path: PathBuf,
    /// Maximum access log file size in bytes before rotation (0 = no limit)
    pub max_access_log_bytes: u64,
    /// Maximum request body size (CSV uploads included).
    pub max_body_bytes: usize,
    pub smtp: SmtpSettings,
    /// Base URL of the web frontend, used in verification links.
    pub frontend_url: String,
    /// Origins allowed to make credentialed cross-origin requests.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            model_path: None,
            expected_features: DEFAULT_EXPECTED_FEATURES,
            top_k: DEFAULT_TOP_K,
            access_log_path: PathBuf::from("xai-ids-access.jsonl"),
            max_access_log_bytes: 50 * 1024 * 1024, // 50 MB
            max_body_bytes: 10 * 1024 * 1024,
            smtp: SmtpSettings {
                port: DEFAULT_SMTP_PORT,
                ..Default::default()
            },
            frontend_url: "http://localhost:3000".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl ServerConfig {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            model_path: self
                .model_path
                .clone()
                .unwrap_or_else(|| self.data_dir.join("model.json")),
            label_mapping_path: self.data_dir.join("label_mapping.json"),
            feature_names_path: self.data_dir.join("feature_names.json"),
            expected_features: self.expected_features,
            top_k: self.top_k,
        }
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body shared by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Error kind for logs; pipeline errors carry [`PredictError::kind`].
    pub kind: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: "request",
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Endpoint not found")
    }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        let status = match e {
            PredictError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PredictError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            PredictError::InferenceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind: e.kind(),
            ..Self::new(status, e.to_string())
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let status = match e {
            AuthError::InvalidEmail | AuthError::WeakPassword | AuthError::InvalidToken => {
                StatusCode::BAD_REQUEST
            }
            AuthError::AlreadyRegistered => StatusCode::CONFLICT,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::NotVerified => StatusCode::FORBIDDEN,
        };
        Self {
            kind: "auth",
            ..Self::new(status, e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(ErrorResponse {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub features: Vec<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    #[serde(default)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub status: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub model_loaded: bool,
    pub model_hash: Option<String>,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    #[serde(flatten)]
    pub prediction: Prediction,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadCsvResponse {
    pub success: bool,
    pub filename: String,
    pub total_rows: usize,
    pub features_in_csv: usize,
    pub features_expected: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub predictions: Vec<RowResult>,
    pub feature_names: Vec<String>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct FeatureNamesResponse {
    pub success: bool,
    pub feature_names: Vec<String>,
    pub feature_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AttackTypesResponse {
    pub success: bool,
    /// class id → attack name
    pub attack_types: BTreeMap<u32, String>,
    /// attack name → class id, in file order
    pub label_mapping: serde_json::Map<String, serde_json::Value>,
    pub total_types: usize,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TestPreprocessingResponse {
    Aligned {
        success: bool,
        original_features: usize,
        expected_features: usize,
        preprocessed_shape: [usize; 2],
        preprocessed_features: Vec<f64>,
        message: String,
    },
    Failed {
        success: bool,
        error: String,
        original_features: usize,
        expected_features: usize,
    },
}

/// Response for signup, login and token verification.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            email: None,
        }
    }
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub model_hash: Option<String>,
    pub requests: RequestStats,
    pub predictions: PredictionStats,
    pub endpoints: EndpointStats,
    pub batch: BatchStats,
    pub registered_users: usize,
}

#[derive(Debug, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub errors: u64,
}

#[derive(Debug, Serialize)]
pub struct PredictionStats {
    pub benign: u64,
    pub attacks: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub predict: u64,
    pub upload_csv: u64,
    pub test_preprocessing: u64,
    pub signup: u64,
    pub login: u64,
    pub verify: u64,
    pub stats: u64,
}

#[derive(Debug, Serialize)]
pub struct BatchStats {
    pub rows: u64,
    pub failed_rows: u64,
}
