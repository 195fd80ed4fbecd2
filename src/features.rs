//! Feature alignment and feature-name configuration.
//!
//! The model accepts exactly `expected_dim` features. Client vectors of any
//! non-zero length are aligned *positionally*: truncated when too long,
//! zero-padded at the end when too short. Feature names are carried along for
//! display only and never influence which value lands in which slot.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{PredictError, PredictResult};

/// Number of features the shipped model was trained on.
pub const DEFAULT_EXPECTED_FEATURES: usize = 78;

/// Align an arbitrary-length input to exactly `expected_dim` values.
pub fn align(input: &[f64], expected_dim: usize) -> PredictResult<Vec<f64>> {
    if input.is_empty() {
        return Err(PredictError::invalid("Features array cannot be empty"));
    }

    let provided = input.len();
    let mut aligned: Vec<f64> = input.iter().copied().take(expected_dim).collect();

    if provided > expected_dim {
        debug!(provided, expected_dim, "truncated feature vector");
    } else if provided < expected_dim {
        aligned.resize(expected_dim, 0.0);
        debug!(
            provided,
            expected_dim,
            padded = expected_dim - provided,
            "zero-padded feature vector"
        );
    }

    Ok(aligned)
}

/// Convert an aligned vector into the model's `f32` input.
///
/// NaN is kept (the trees route it along their default branch). Infinite
/// values, and finite values outside the `f32` range, are rejected.
pub fn to_model_input(aligned: &[f64]) -> PredictResult<Vec<f32>> {
    aligned
        .iter()
        .enumerate()
        .map(|(idx, &v)| {
            if v.is_nan() {
                return Ok(f32::NAN);
            }
            let narrowed = v as f32;
            if narrowed.is_finite() {
                Ok(narrowed)
            } else {
                Err(PredictError::inference(format!(
                    "feature {} has value {} which is not representable as a finite f32",
                    idx, v
                )))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Feature names
// ---------------------------------------------------------------------------

/// Display names for the model's input columns, always `expected_dim` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureNames {
    names: Vec<String>,
}

impl FeatureNames {
    /// `Feature_1 .. Feature_<n>`.
    pub fn synthetic(expected_dim: usize) -> Self {
        Self {
            names: (1..=expected_dim).map(|i| format!("Feature_{}", i)).collect(),
        }
    }

    /// Build from a configured list, patching its length to `expected_dim`.
    ///
    /// Short lists are extended with `Additional_Feature_N`; long lists are
    /// cut. This only ever changes labels, never the numeric alignment.
    pub fn from_list(mut names: Vec<String>, expected_dim: usize) -> Self {
        if names.len() < expected_dim {
            let missing = expected_dim - names.len();
            names.extend((1..=missing).map(|i| format!("Additional_Feature_{}", i)));
            info!(
                extended_by = missing,
                total = names.len(),
                "extended feature names to match model input"
            );
        } else if names.len() > expected_dim {
            warn!(
                configured = names.len(),
                expected_dim, "feature name list longer than model input; extra names ignored"
            );
            names.truncate(expected_dim);
        }
        Self { names }
    }

    /// Load the name list from a JSON array file.
    ///
    /// A missing or unreadable file falls back to synthetic names.
    pub fn load(path: &Path, expected_dim: usize) -> Self {
        if !path.exists() {
            warn!(path = %path.display(), "feature names file not found, using default names");
            return Self::synthetic(expected_dim);
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<Vec<String>>(&s).map_err(|e| e.to_string()));
        match parsed {
            Ok(names) => {
                info!(count = names.len(), path = %path.display(), "loaded feature names");
                Self::from_list(names, expected_dim)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not parse feature names, using default names");
                Self::synthetic(expected_dim)
            }
        }
    }

    /// Name for a feature index; out-of-range indices get `F<idx+1>`.
    pub fn name(&self, idx: usize) -> String {
        self.names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("F{}", idx + 1))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_identity_on_exact_length() {
        let v: Vec<f64> = (0..78).map(|i| i as f64 * 0.5).collect();
        assert_eq!(align(&v, 78).unwrap(), v);
    }

    #[test]
    fn test_align_truncates_long_input() {
        let v: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let out = align(&v, 78).unwrap();
        assert_eq!(out.len(), 78);
        assert_eq!(out[..], v[..78]);
    }

    #[test]
    fn test_align_pads_short_input_with_zeros() {
        let out = align(&[1.0, 2.0, 3.0], 78).unwrap();
        assert_eq!(out.len(), 78);
        assert_eq!(&out[..3], &[1.0, 2.0, 3.0]);
        assert!(out[3..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_align_rejects_empty_input() {
        let err = align(&[], 78).unwrap_err();
        assert!(matches!(err, PredictError::InvalidInput(_)));
    }

    #[test]
    fn test_to_model_input_rejects_infinite_values() {
        assert!(to_model_input(&[1.0, f64::INFINITY]).is_err());
        // finite as f64 but overflows f32
        let err = to_model_input(&[1e300]).unwrap_err();
        assert!(err.to_string().contains("feature 0"));
    }

    #[test]
    fn test_to_model_input_keeps_nan_as_missing() {
        let out = to_model_input(&[f64::NAN, 2.5]).unwrap();
        assert!(out[0].is_nan());
        assert_eq!(out[1], 2.5);
    }

    #[test]
    fn test_feature_names_extended_with_placeholders() {
        let names = FeatureNames::from_list(vec!["Dst Port".into(), "Protocol".into()], 5);
        assert_eq!(names.len(), 5);
        assert_eq!(names.name(0), "Dst Port");
        assert_eq!(names.name(2), "Additional_Feature_1");
        assert_eq!(names.name(4), "Additional_Feature_3");
    }

    #[test]
    fn test_feature_names_missing_file_uses_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let names = FeatureNames::load(&dir.path().join("absent.json"), 3);
        assert_eq!(names.as_slice(), &["Feature_1", "Feature_2", "Feature_3"]);
        assert_eq!(names.name(7), "F8");
    }

    #[test]
    fn test_feature_names_loaded_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature_names.json");
        std::fs::write(&path, r#"["Flow Duration", "Tot Fwd Pkts", "Tot Bwd Pkts"]"#).unwrap();
        let names = FeatureNames::load(&path, 2);
        assert_eq!(names.as_slice(), &["Flow Duration", "Tot Fwd Pkts"]);
    }
}
