//! xai-ids: explainable network intrusion detection over HTTP.
//!
//! A gradient-boosted tree ensemble classifies network flow feature vectors
//! into benign traffic or one of the known attack types. Every prediction
//! comes with exact TreeSHAP attributions for the predicted class, so
//! analysts can see which features drove the decision.
//!
//! Pipeline: [`features::align`] → [`model::TreeEnsemble`] →
//! [`explain::TreeExplainer`] → [`labels::LabelMapping`], wired together by
//! [`detector::Detector`] and served by [`server`]. CSV uploads are scored row
//! by row through [`batch`]. A small account system ([`auth`], [`mailer`])
//! gates the web frontend.
//!
//! Uses structured logging via [`tracing`]. Set the `RUST_LOG` environment
//! variable to control log verbosity (e.g., `RUST_LOG=xai_ids=debug`).

pub mod auth;
pub mod batch;
pub mod detector;
pub mod error;
pub mod explain;
pub mod features;
pub mod labels;
pub mod mailer;
pub mod model;
pub mod server;
pub mod ui;

pub use detector::{Classifier, Detector, DetectorConfig, Prediction};
pub use error::{PredictError, PredictResult};

use sha2::{Digest, Sha256};

/// SHA-256 of a model artifact, formatted as `sha256:<hex>`.
pub fn artifact_hash(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("sha256:{}", hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_hash_format() {
        let h = artifact_hash(b"{}");
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
        assert_eq!(h, artifact_hash(b"{}"));
        assert_ne!(h, artifact_hash(b"{ }"));
    }
}
