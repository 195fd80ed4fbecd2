//! HTTP server for the explainable intrusion detection service.
//!
//! Features:
//! - Single and batch (CSV) prediction with TreeSHAP attributions
//! - Email/password accounts with verification links
//! - JSONL access logging with size-based rotation (configurable via `max_access_log_bytes`)
//! - Periodic `metrics.json` snapshots in the data directory
//! - Structured logging via [`tracing`]

pub mod handlers;
pub mod logging;
pub mod types;

pub use logging::{RecordEvent, UsageMetrics, METRICS_PERSIST_INTERVAL_SECS};
pub use types::{
    ApiError, HealthResponse, PredictResponse, ServerConfig, StatsResponse, UploadCsvResponse,
    DEFAULT_DATA_DIR,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use eyre::{Result, WrapErr};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::UserStore;
use crate::detector::Detector;
use crate::mailer::Mailer;

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub config: ServerConfig,
    pub detector: Arc<Detector>,
    pub users: UserStore,
    pub mailer: Mailer,
    pub start_time: Instant,
    pub usage: UsageMetrics,
}

impl ServerState {
    /// Load every artifact named by `config`.
    pub fn new(config: ServerConfig) -> Self {
        let detector = Detector::load(&config.detector_config());
        Self::with_detector(config, detector)
    }

    /// Assemble state around an already-built detector.
    pub fn with_detector(config: ServerConfig, detector: Detector) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            warn!(path = %config.data_dir.display(), error = %e, "could not create data directory");
        }
        let usage = UsageMetrics::new(
            &config.access_log_path,
            config.max_access_log_bytes,
            &config.data_dir,
        );
        let users = UserStore::open(config.users_path());
        let mailer = Mailer::from_settings(&config.smtp, &config.frontend_url);

        Self {
            config,
            detector: Arc::new(detector),
            users,
            mailer,
            start_time: Instant::now(),
            usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(origin = %o, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Build the full application router around `state`.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/predict", post(handlers::predict_handler))
        .route("/upload-csv", post(handlers::upload_csv_handler))
        .route("/feature-names", get(handlers::feature_names_handler))
        .route("/attack-types", get(handlers::attack_types_handler))
        .route(
            "/test-preprocessing",
            post(handlers::test_preprocessing_handler),
        )
        .route("/signup", post(handlers::signup_handler))
        .route("/login", post(handlers::login_handler))
        .route("/verify", post(handlers::verify_handler))
        .route("/verify-email", get(handlers::verify_email_handler))
        .fallback(handlers::not_found_handler)
        .layer(cors_layer(&state.config.cors_origins))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Run the HTTP server until SIGINT/SIGTERM.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let bind_addr = config.bind_addr;
    let access_log = config.access_log_path.clone();
    let state = Arc::new(ServerState::new(config));
    let app = build_router(state.clone());

    // Spawn background task to persist metrics to disk periodically
    let metrics_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            METRICS_PERSIST_INTERVAL_SECS,
        ));
        loop {
            interval.tick().await;
            metrics_state.usage.persist_to_disk();
        }
    });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {}", bind_addr))?;
    info!(bind = %bind_addr, "xai-ids server listening");
    info!("Endpoints: GET /, GET /health, GET /stats, POST /predict, POST /upload-csv, GET /feature-names, GET /attack-types, POST /test-preprocessing, POST /signup, POST /login, POST /verify, GET /verify-email");
    if state.detector.model_loaded() {
        info!(
            model_hash = state.detector.model_hash().unwrap_or_default(),
            expected_features = state.detector.expected_dim(),
            "model ready"
        );
    } else {
        warn!("no model loaded; /predict and /upload-csv will return 503");
    }
    if !state.mailer.is_enabled() {
        info!("verification emails disabled");
    }
    info!(access_log = %access_log.display());

    // Graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = state;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Persist metrics before exiting
        shutdown_state.usage.persist_to_disk();
    })
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down gracefully"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received SIGINT, shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT, shutting down gracefully");
    }
}
