//! HTTP endpoint handler functions.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Query, State};
use axum::response::Html;
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::auth::{AuthError, VerifyOutcome};
use crate::batch::{parse_csv, run_batch, BatchSummary, RowResult};
use crate::error::PredictError;
use crate::features::align;
use crate::ui::{verify_page, VerifyPage};

use super::logging::RecordEvent;
use super::types::*;
use super::ServerState;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// Service info
// ---------------------------------------------------------------------------

pub async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Explainable AI Backend is running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "healthy".to_string(),
    })
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        message: "Server is running".to_string(),
        model_loaded: state.detector.model_loaded(),
        model_hash: state.detector.model_hash().map(str::to_string),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

pub async fn stats_handler(State(state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    let u = &state.usage;
    u.ep_stats.fetch_add(1, Ordering::Relaxed);
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        model_hash: state.detector.model_hash().map(str::to_string),
        requests: RequestStats {
            total: u.total_requests.load(Ordering::Relaxed),
            errors: u.total_errors.load(Ordering::Relaxed),
        },
        predictions: PredictionStats {
            benign: u.benign.load(Ordering::Relaxed),
            attacks: u.attacks.load(Ordering::Relaxed),
        },
        endpoints: EndpointStats {
            predict: u.ep_predict.load(Ordering::Relaxed),
            upload_csv: u.ep_upload_csv.load(Ordering::Relaxed),
            test_preprocessing: u.ep_test_preprocessing.load(Ordering::Relaxed),
            signup: u.ep_signup.load(Ordering::Relaxed),
            login: u.ep_login.load(Ordering::Relaxed),
            verify: u.ep_verify.load(Ordering::Relaxed),
            stats: u.ep_stats.load(Ordering::Relaxed),
        },
        batch: BatchStats {
            rows: u.batch_rows.load(Ordering::Relaxed),
            failed_rows: u.batch_failed_rows.load(Ordering::Relaxed),
        },
        registered_users: state.users.user_count().await,
    })
}

pub async fn not_found_handler() -> ApiError {
    ApiError::not_found()
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

pub async fn predict_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<PredictResponse> {
    let start = Instant::now();
    state.usage.ep_predict.fetch_add(1, Ordering::Relaxed);

    let result = predict_inner(&state, &body);
    match result {
        Ok(prediction) => {
            let processing_time_ms = elapsed_ms(start);
            state.usage.record(&RecordEvent {
                endpoint: "predict",
                prediction: &prediction,
                processing_time_ms,
            });
            info!(
                prediction = prediction.class_id,
                attack_type = %prediction.attack.attack_type,
                features_used = prediction.features_used,
                processing_time_ms,
                "prediction served"
            );
            Ok(Json(PredictResponse {
                success: true,
                prediction,
                feature_names: state.detector.feature_names().as_slice().to_vec(),
            }))
        }
        Err(e) => {
            state.usage.record_error();
            warn!(status = %e.status, kind = e.kind, error = %e.message, "prediction rejected");
            Err(e)
        }
    }
}

fn predict_inner(state: &ServerState, body: &[u8]) -> Result<crate::detector::Prediction, ApiError> {
    let classifier = state.detector.classifier()?;
    let request: PredictRequest = parse_json(body)?;
    Ok(state.detector.predict_with(classifier, &request.features)?)
}

pub async fn upload_csv_handler(
    State(state): State<Arc<ServerState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<UploadCsvResponse> {
    let start = Instant::now();
    state.usage.ep_upload_csv.fetch_add(1, Ordering::Relaxed);

    match upload_csv_inner(&state, multipart, start).await {
        Ok(response) => {
            state.usage.record_request();
            Ok(Json(response))
        }
        Err(e) => {
            state.usage.record_error();
            warn!(status = %e.status, kind = e.kind, error = %e.message, "CSV upload rejected");
            Err(e)
        }
    }
}

async fn upload_csv_inner(
    state: &Arc<ServerState>,
    multipart: Result<Multipart, MultipartRejection>,
    start: Instant,
) -> Result<UploadCsvResponse, ApiError> {
    state.detector.classifier()?;
    let mut multipart =
        multipart.map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
        upload = Some((filename, data));
        break;
    }
    let Some((filename, data)) = upload else {
        return Err(ApiError::bad_request("Missing 'file' field"));
    };
    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return Err(PredictError::invalid("File must be a CSV file").into());
    }

    info!(filename = %filename, bytes = data.len(), "processing CSV upload");
    let batch = parse_csv(&data)?;

    let detector = state.detector.clone();
    let (batch, results) = tokio::task::spawn_blocking(move || {
        let results = run_batch(&detector, &batch);
        (batch, results)
    })
    .await
    .map_err(|e| PredictError::inference(format!("batch task failed: {}", e)))?;
    let results = results?;

    let processing_time_ms = elapsed_ms(start);
    for result in &results {
        match result {
            RowResult::Scored { prediction, .. } => state.usage.record_batch_row(&RecordEvent {
                endpoint: "upload-csv",
                prediction,
                processing_time_ms,
            }),
            RowResult::Failed { .. } => state.usage.record_batch_failure(),
        }
    }
    let summary = BatchSummary::from_results(&results);

    Ok(UploadCsvResponse {
        success: true,
        filename,
        total_rows: batch.row_count(),
        features_in_csv: batch.feature_count(),
        features_expected: state.detector.expected_dim(),
        successful_rows: summary.successful_rows,
        failed_rows: summary.failed_rows,
        predictions: results,
        feature_names: state.detector.feature_names().as_slice().to_vec(),
        processing_time_ms,
    })
}

pub async fn feature_names_handler(
    State(state): State<Arc<ServerState>>,
) -> Json<FeatureNamesResponse> {
    Json(FeatureNamesResponse {
        success: true,
        feature_names: state.detector.feature_names().as_slice().to_vec(),
        feature_count: state.detector.expected_dim(),
    })
}

pub async fn attack_types_handler(
    State(state): State<Arc<ServerState>>,
) -> Json<AttackTypesResponse> {
    let labels = state.detector.labels();
    let label_mapping = labels
        .entries()
        .iter()
        .map(|(name, id)| (name.clone(), serde_json::Value::from(*id)))
        .collect();
    Json(AttackTypesResponse {
        success: true,
        attack_types: labels.reverse().clone(),
        label_mapping,
        total_types: labels.reverse().len(),
    })
}

pub async fn test_preprocessing_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<TestPreprocessingResponse> {
    state.usage.ep_test_preprocessing.fetch_add(1, Ordering::Relaxed);
    let request: PredictRequest = parse_json(&body).inspect_err(|_| state.usage.record_error())?;
    state.usage.record_request();

    let expected = state.detector.expected_dim();
    let provided = request.features.len();
    let response = match align(&request.features, expected) {
        Ok(aligned) => TestPreprocessingResponse::Aligned {
            success: true,
            original_features: provided,
            expected_features: expected,
            preprocessed_shape: [1, aligned.len()],
            preprocessed_features: aligned,
            message: format!(
                "Successfully preprocessed {} features to {} features",
                provided, expected
            ),
        },
        Err(e) => TestPreprocessingResponse::Failed {
            success: false,
            error: e.to_string(),
            original_features: provided,
            expected_features: expected,
        },
    };
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

fn auth_failure(state: &ServerState, e: AuthError) -> ApiError {
    state.usage.record_error();
    e.into()
}

pub async fn signup_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<MessageResponse> {
    state.usage.ep_signup.fetch_add(1, Ordering::Relaxed);
    let request: AuthRequest = parse_json(&body).inspect_err(|_| state.usage.record_error())?;

    let token = state
        .users
        .signup(&request.email, &request.password)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    state.usage.record_request();

    let sent = state
        .mailer
        .send_verification(&request.email, &token)
        .await;
    let message = if sent {
        "Signup successful. Please check your email to verify your account."
    } else {
        "Signup successful. Email verification failed - please contact support."
    };
    Ok(Json(MessageResponse::ok(message)))
}

pub async fn login_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<MessageResponse> {
    state.usage.ep_login.fetch_add(1, Ordering::Relaxed);
    let request: AuthRequest = parse_json(&body).inspect_err(|_| state.usage.record_error())?;

    state
        .users
        .login(&request.email, &request.password)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    state.usage.record_request();

    Ok(Json(MessageResponse {
        success: true,
        message: "Login successful".to_string(),
        email: Some(request.email),
    }))
}

pub async fn verify_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<MessageResponse> {
    state.usage.ep_verify.fetch_add(1, Ordering::Relaxed);
    let request: TokenRequest = parse_json(&body).inspect_err(|_| state.usage.record_error())?;

    let outcome = state
        .users
        .verify(&request.token)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    state.usage.record_request();
    Ok(Json(MessageResponse::ok(outcome.message())))
}

pub async fn verify_email_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<VerifyEmailQuery>,
) -> Html<String> {
    state.usage.ep_verify.fetch_add(1, Ordering::Relaxed);
    state.usage.record_request();

    let page = match query.token.as_deref().filter(|t| !t.is_empty()) {
        None => VerifyPage::Invalid,
        Some(token) => match state.users.verify(token).await {
            Ok(VerifyOutcome::Verified) => VerifyPage::Verified,
            Ok(VerifyOutcome::AlreadyVerified) => VerifyPage::AlreadyVerified,
            Err(_) => VerifyPage::Invalid,
        },
    };
    verify_page(page, &state.config.frontend_url)
}
