//! Per-prediction feature attributions for tree ensembles.
//!
//! Implements path-dependent TreeSHAP (Lundberg, Erion & Lee, "Consistent
//! Individualized Feature Attribution for Tree Ensembles", 2018, Algorithm 2).
//! For one input row and one margin group it returns exact Shapley values of
//! the group's raw margin, using training cover as the background
//! distribution. Local accuracy holds:
//!
//! ```text
//! expected_value(group) + sum(shap_values) == margin(group)
//! ```
//!
//! The explainer only caches per-group expected values, so one instance is
//! built per loaded model and shared read-only between requests.

use crate::error::PredictResult;
use crate::model::{Tree, TreeEnsemble, TreeNode};

/// One entry of the unique feature path maintained during the recursion.
#[derive(Debug, Clone, Copy)]
struct PathElement {
    /// `None` for the synthetic root element.
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

/// Cached explanation context for a single model.
#[derive(Debug, Clone)]
pub struct TreeExplainer {
    expected_values: Vec<f64>,
}

impl TreeExplainer {
    pub fn new(model: &TreeEnsemble) -> Self {
        let mut expected_values = vec![model.base_score; model.num_groups()];
        for tree in &model.trees {
            expected_values[tree.class_id] += tree_expected_value(tree, 0);
        }
        Self { expected_values }
    }

    /// Baseline margin of a group (cover-weighted mean over training data).
    pub fn expected_value(&self, group: usize) -> f64 {
        self.expected_values.get(group).copied().unwrap_or(0.0)
    }

    /// SHAP values of `group`'s margin for input `x`, one per model feature.
    pub fn shap_values(
        &self,
        model: &TreeEnsemble,
        x: &[f32],
        group: usize,
    ) -> PredictResult<Vec<f64>> {
        if x.len() != model.num_features {
            return Err(crate::error::PredictError::inference(format!(
                "explainer expects {} features, got {}",
                model.num_features,
                x.len()
            )));
        }
        let mut phi = vec![0.0; model.num_features];
        for tree in model.trees.iter().filter(|t| t.class_id == group) {
            recurse(tree, x, &mut phi, 0, &[], 1.0, 1.0, None);
        }
        if let Some(idx) = phi.iter().position(|v| !v.is_finite()) {
            return Err(crate::error::PredictError::inference(format!(
                "attribution for feature {} is not finite",
                idx
            )));
        }
        Ok(phi)
    }
}

/// Indices of the `k` largest attributions by absolute value.
///
/// The sort is stable, so equal magnitudes keep ascending index order.
pub fn top_k(attributions: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..attributions.len()).collect();
    order.sort_by(|&a, &b| attributions[b].abs().total_cmp(&attributions[a].abs()));
    order.truncate(k);
    order
}

fn tree_expected_value(tree: &Tree, idx: usize) -> f64 {
    match &tree.nodes[idx] {
        TreeNode::Leaf { leaf, .. } => *leaf,
        TreeNode::Split {
            left, right, cover, ..
        } => {
            let l = tree.nodes[*left].cover();
            let r = tree.nodes[*right].cover();
            (l * tree_expected_value(tree, *left) + r * tree_expected_value(tree, *right)) / cover
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &Tree,
    x: &[f32],
    phi: &mut [f64],
    node: usize,
    parent_path: &[PathElement],
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let mut path = parent_path.to_vec();
    extend_path(&mut path, zero_fraction, one_fraction, feature);

    match &tree.nodes[node] {
        TreeNode::Leaf { leaf, .. } => {
            for i in 1..path.len() {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    phi[f] += w * (el.one_fraction - el.zero_fraction) * leaf;
                }
            }
        }
        TreeNode::Split {
            split_feature,
            left,
            right,
            cover,
            ..
        } => {
            let hot = tree.next(node, x);
            let cold = if hot == *left { *right } else { *left };
            let hot_zero_fraction = tree.nodes[hot].cover() / cover;
            let cold_zero_fraction = tree.nodes[cold].cover() / cover;

            // A feature seen earlier on this path is undone and folded into
            // the fractions passed down.
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(pos) = path.iter().position(|el| el.feature == Some(*split_feature)) {
                incoming_zero = path[pos].zero_fraction;
                incoming_one = path[pos].one_fraction;
                unwind_path(&mut path, pos);
            }

            recurse(
                tree,
                x,
                phi,
                hot,
                &path,
                hot_zero_fraction * incoming_zero,
                incoming_one,
                Some(*split_feature),
            );
            recurse(
                tree,
                x,
                phi,
                cold,
                &path,
                cold_zero_fraction * incoming_zero,
                0.0,
                Some(*split_feature),
            );
        }
    }
}

fn extend_path(
    path: &mut Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let denom = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / denom;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / denom;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, path_index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let denom = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next_one_portion * denom / ((i + 1) as f64 * one_fraction);
            next_one_portion =
                tmp - path[i].pweight * zero_fraction * (depth - i) as f64 / denom;
        } else {
            path[i].pweight = path[i].pweight * denom / (zero_fraction * (depth - i) as f64);
        }
    }

    // pweights stay in place; only the feature data shifts down
    for i in path_index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], path_index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let mut next_one_portion = path[depth].pweight;
    let mut total = 0.0;

    if one_fraction != 0.0 {
        for i in (0..depth).rev() {
            let tmp = next_one_portion / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].pweight - tmp * zero_fraction * (depth - i) as f64;
        }
    } else {
        for i in (0..depth).rev() {
            total += path[i].pweight / (zero_fraction * (depth - i) as f64);
        }
    }
    total * (depth + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_model;

    const EPS: f64 = 1e-9;

    /// E[f(x) | x_S] under the cover distribution (Algorithm 1 of the paper).
    fn cond_expectation(tree: &Tree, idx: usize, x: &[f32], known: u32) -> f64 {
        match &tree.nodes[idx] {
            TreeNode::Leaf { leaf, .. } => *leaf,
            TreeNode::Split {
                split_feature,
                left,
                right,
                cover,
                ..
            } => {
                if known & (1 << split_feature) != 0 {
                    cond_expectation(tree, tree.next(idx, x), x, known)
                } else {
                    let l = tree.nodes[*left].cover();
                    let r = tree.nodes[*right].cover();
                    (l * cond_expectation(tree, *left, x, known)
                        + r * cond_expectation(tree, *right, x, known))
                        / cover
                }
            }
        }
    }

    /// Exact Shapley values by subset enumeration.
    fn brute_force_shap(model: &TreeEnsemble, x: &[f32], group: usize) -> Vec<f64> {
        let m = model.num_features;
        let value = |set: u32| -> f64 {
            model
                .trees
                .iter()
                .filter(|t| t.class_id == group)
                .map(|t| cond_expectation(t, 0, x, set))
                .sum()
        };
        let fact = |n: usize| -> f64 { (1..=n).map(|v| v as f64).product() };
        let mut phi = vec![0.0; m];
        for (i, slot) in phi.iter_mut().enumerate() {
            for set in 0u32..(1 << m) {
                if set & (1 << i) != 0 {
                    continue;
                }
                let s = set.count_ones() as usize;
                let weight = fact(s) * fact(m - s - 1) / fact(m);
                *slot += weight * (value(set | (1 << i)) - value(set));
            }
        }
        phi
    }

    #[test]
    fn test_single_stump_attribution() {
        let model = TreeEnsemble::from_json(
            br#"{
                "num_features": 1, "num_classes": 2,
                "trees": [{ "nodes": [
                    { "split_feature": 0, "threshold": 0.5, "left": 1, "right": 2, "cover": 100.0 },
                    { "leaf": 1.0, "cover": 30.0 },
                    { "leaf": -1.0, "cover": 70.0 }
                ]}]
            }"#,
        )
        .unwrap();
        let explainer = TreeExplainer::new(&model);
        assert!((explainer.expected_value(0) - (-0.4)).abs() < EPS);
        let phi = explainer.shap_values(&model, &[0.0], 0).unwrap();
        assert!((phi[0] - 1.4).abs() < EPS);
    }

    #[test]
    fn test_local_accuracy_every_group() {
        let model = sample_model();
        let explainer = TreeExplainer::new(&model);
        let inputs: [[f32; 3]; 4] = [
            [1.0, 0.0, 5.0],
            [9.0, 0.0, 5.0],
            [9.0, 5.0, 20.0],
            [4.0, 3.0, 1.0],
        ];
        for x in &inputs {
            let margins = model.margins(x).unwrap();
            for group in 0..model.num_groups() {
                let phi = explainer.shap_values(&model, x, group).unwrap();
                let total: f64 = phi.iter().sum::<f64>() + explainer.expected_value(group);
                assert!(
                    (total - margins[group]).abs() < EPS,
                    "group {} input {:?}: {} vs {}",
                    group,
                    x,
                    total,
                    margins[group]
                );
            }
        }
    }

    #[test]
    fn test_matches_exact_shapley_values() {
        let model = sample_model();
        let explainer = TreeExplainer::new(&model);
        let x = [9.0f32, 1.0, 2.0];
        for group in 0..3 {
            let fast = explainer.shap_values(&model, &x, group).unwrap();
            let exact = brute_force_shap(&model, &x, group);
            for (a, b) in fast.iter().zip(&exact) {
                assert!((a - b).abs() < EPS, "group {}: {:?} vs {:?}", group, fast, exact);
            }
        }
    }

    #[test]
    fn test_unused_feature_gets_zero() {
        let model = sample_model();
        let explainer = TreeExplainer::new(&model);
        // class-0 tree only looks at feature 0
        let phi = explainer.shap_values(&model, &[1.0, 7.0, 7.0], 0).unwrap();
        assert_eq!(phi[1], 0.0);
        assert_eq!(phi[2], 0.0);
        assert!(phi[0] > 0.0);
    }

    #[test]
    fn test_shap_is_deterministic() {
        let model = sample_model();
        let explainer = TreeExplainer::new(&model);
        let x = [9.0f32, 5.0, 20.0];
        let a = explainer.shap_values(&model, &x, 2).unwrap();
        let b = explainer.shap_values(&model, &x, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_top_k_orders_by_magnitude() {
        let attributions = [0.1, -0.9, 0.3, 0.05, 0.2, 0.0];
        assert_eq!(top_k(&attributions, 3), vec![1, 2, 4]);
    }

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let attributions = [0.2, -0.5, 0.5, -0.2, 0.0];
        assert_eq!(top_k(&attributions, 4), vec![1, 2, 0, 3]);
        assert_eq!(top_k(&attributions, 10).len(), 5);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let model = sample_model();
        let explainer = TreeExplainer::new(&model);
        assert!(explainer.shap_values(&model, &[1.0], 0).is_err());
    }
}
