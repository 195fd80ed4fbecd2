//! Prediction pipeline: align → score → explain → resolve label.
//!
//! [`Detector`] is the process-wide context built once at startup and shared
//! by every request through an `Arc`. Nothing in it is mutated after
//! construction, so concurrent scoring needs no locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PredictError, PredictResult};
use crate::explain::{top_k, TreeExplainer};
use crate::features::{align, to_model_input, FeatureNames, DEFAULT_EXPECTED_FEATURES};
use crate::labels::{AttackInfo, LabelMapping};
use crate::model::TreeEnsemble;

/// Number of attributions reported per prediction.
pub const DEFAULT_TOP_K: usize = 5;

// ---------------------------------------------------------------------------
// Classifier: model + cached explainer
// ---------------------------------------------------------------------------

/// A loaded model together with its explanation context.
#[derive(Debug)]
pub struct Classifier {
    model: TreeEnsemble,
    explainer: TreeExplainer,
    hash: String,
}

/// Raw engine output for one aligned row.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub class_id: u32,
    /// Baseline margin of the explained group.
    pub base_value: f64,
    /// `(feature index, attribution)`, strongest first.
    pub attributions: Vec<(usize, f64)>,
}

impl Classifier {
    pub fn new(model: TreeEnsemble, hash: String) -> Self {
        let explainer = TreeExplainer::new(&model);
        Self {
            model,
            explainer,
            hash,
        }
    }

    /// Read, hash and validate a model artifact.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read model file {}", path.display()))?;
        let hash = crate::artifact_hash(&bytes);
        let model = TreeEnsemble::from_json(&bytes)?;
        Ok(Self::new(model, hash))
    }

    pub fn num_features(&self) -> usize {
        self.model.num_features
    }

    pub fn model(&self) -> &TreeEnsemble {
        &self.model
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Score an aligned row and attribute the predicted class's margin.
    pub fn infer_and_explain(&self, aligned: &[f64], k: usize) -> PredictResult<Explanation> {
        let x = to_model_input(aligned)?;
        let class_id = self.model.predict_class(&x)?;
        let group = self.model.group_for_class(class_id);
        let phi = self.explainer.shap_values(&self.model, &x, group)?;
        let attributions = top_k(&phi, k)
            .into_iter()
            .map(|idx| (idx, phi[idx]))
            .collect();
        Ok(Explanation {
            class_id,
            base_value: self.explainer.expected_value(group),
            attributions,
        })
    }
}

// ---------------------------------------------------------------------------
// Prediction result
// ---------------------------------------------------------------------------

/// One of the top contributing features.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature_idx: usize,
    pub feature_name: String,
    pub feature_value: f64,
    pub shap_value: f64,
}

/// Fully resolved prediction for one input row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    #[serde(rename = "prediction")]
    pub class_id: u32,
    #[serde(flatten)]
    pub attack: AttackInfo,
    /// Indices of the top features, strongest first.
    pub top_features: Vec<usize>,
    /// Attributions of `top_features`, same order.
    pub shap_values: Vec<f64>,
    pub top_features_detailed: Vec<FeatureContribution>,
    pub base_value: f64,
    pub features_used: usize,
    pub features_expected: usize,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Where the detector loads its artifacts from.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub label_mapping_path: PathBuf,
    pub feature_names_path: PathBuf,
    /// Input width assumed when no model could be loaded.
    pub expected_features: usize,
    pub top_k: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("data/model.json"),
            label_mapping_path: PathBuf::from("data/label_mapping.json"),
            feature_names_path: PathBuf::from("data/feature_names.json"),
            expected_features: DEFAULT_EXPECTED_FEATURES,
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Debug)]
pub struct Detector {
    classifier: Option<Arc<Classifier>>,
    labels: LabelMapping,
    feature_names: FeatureNames,
    expected_dim: usize,
    top_k: usize,
}

impl Detector {
    /// Assemble a detector from already-loaded parts.
    ///
    /// With a classifier, the input width comes from the model; without one
    /// it falls back to `fallback_dim`.
    pub fn new(
        classifier: Option<Classifier>,
        labels: LabelMapping,
        feature_names: Option<Vec<String>>,
        fallback_dim: usize,
        top_k: usize,
    ) -> Self {
        Self::assemble(classifier, labels, fallback_dim, top_k, |dim| match feature_names {
            Some(names) => FeatureNames::from_list(names, dim),
            None => FeatureNames::synthetic(dim),
        })
    }

    /// Fix the input width, then build the feature names for it.
    fn assemble(
        classifier: Option<Classifier>,
        labels: LabelMapping,
        fallback_dim: usize,
        top_k: usize,
        feature_names: impl FnOnce(usize) -> FeatureNames,
    ) -> Self {
        let expected_dim = classifier
            .as_ref()
            .map(Classifier::num_features)
            .unwrap_or(fallback_dim);
        Self {
            classifier: classifier.map(Arc::new),
            labels,
            feature_names: feature_names(expected_dim),
            expected_dim,
            top_k,
        }
    }

    /// Load model, labels and feature names. A model that fails to load
    /// leaves the detector running in "unavailable" mode.
    pub fn load(config: &DetectorConfig) -> Self {
        let classifier = match Classifier::load(&config.model_path) {
            Ok(c) => {
                info!(
                    path = %config.model_path.display(),
                    hash = %c.hash(),
                    features = c.num_features(),
                    classes = c.model().num_classes,
                    trees = c.model().trees.len(),
                    max_depth = c.model().max_depth(),
                    "tree ensemble loaded"
                );
                Some(c)
            }
            Err(e) => {
                warn!(
                    path = %config.model_path.display(),
                    error = %format!("{:#}", e),
                    "model unavailable; prediction endpoints will return 503"
                );
                None
            }
        };

        let labels = LabelMapping::load(&config.label_mapping_path);
        let detector = Self::assemble(
            classifier,
            labels,
            config.expected_features,
            config.top_k,
            |dim| FeatureNames::load(&config.feature_names_path, dim),
        );
        info!(expected_dim = detector.expected_dim, "model input width");
        detector
    }

    /// The loaded classifier, or `ModelUnavailable`.
    pub fn classifier(&self) -> PredictResult<&Classifier> {
        self.classifier
            .as_deref()
            .ok_or(PredictError::ModelUnavailable)
    }

    pub fn model_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn model_hash(&self) -> Option<&str> {
        self.classifier.as_deref().map(Classifier::hash)
    }

    pub fn expected_dim(&self) -> usize {
        self.expected_dim
    }

    pub fn labels(&self) -> &LabelMapping {
        &self.labels
    }

    pub fn feature_names(&self) -> &FeatureNames {
        &self.feature_names
    }

    /// Full pipeline for one feature vector.
    pub fn predict(&self, features: &[f64]) -> PredictResult<Prediction> {
        let classifier = self.classifier()?;
        self.predict_with(classifier, features)
    }

    /// Pipeline for one row once model availability has been established.
    pub fn predict_with(
        &self,
        classifier: &Classifier,
        features: &[f64],
    ) -> PredictResult<Prediction> {
        let aligned = align(features, self.expected_dim)?;
        let explanation = classifier.infer_and_explain(&aligned, self.top_k)?;
        let attack = self.labels.resolve(explanation.class_id);

        debug!(
            class_id = explanation.class_id,
            attack_type = %attack.attack_type,
            provided = features.len(),
            "prediction"
        );

        let top_features_detailed: Vec<FeatureContribution> = explanation
            .attributions
            .iter()
            .map(|&(idx, value)| FeatureContribution {
                feature_idx: idx,
                feature_name: self.feature_names.name(idx),
                feature_value: aligned[idx],
                shap_value: value,
            })
            .collect();

        Ok(Prediction {
            class_id: explanation.class_id,
            attack,
            top_features: explanation.attributions.iter().map(|(i, _)| *i).collect(),
            shap_values: explanation.attributions.iter().map(|(_, v)| *v).collect(),
            top_features_detailed,
            base_value: explanation.base_value,
            features_used: features.len(),
            features_expected: self.expected_dim,
        })
    }
}
