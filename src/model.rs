//! Frozen gradient-boosted tree ensemble.
//!
//! The artifact is a JSON document exported from the training notebook:
//!
//! ```json
//! {
//!   "num_features": 78,
//!   "num_classes": 16,
//!   "base_score": 0.5,
//!   "trees": [
//!     { "class_id": 0, "nodes": [
//!         { "split_feature": 3, "threshold": 1.5, "left": 1, "right": 2,
//!           "default_left": true, "cover": 120.0 },
//!         { "leaf": 0.21, "cover": 80.0 },
//!         { "leaf": -0.34, "cover": 40.0 }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Trees are grouped by `class_id`: multi-class models carry one group per
//! class and predict the argmax of the group margins. A two-class model whose
//! trees all sit in group 0 is a binary logistic model and predicts class 1
//! when its margin is positive. `base_score` is added to every margin.
//!
//! A split sends `x[split_feature] < threshold` left, everything else right;
//! NaN follows `default_left`. Node 0 is the root and children always come
//! after their parent, which rules out cycles.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::error::{PredictError, PredictResult};

fn default_true() -> bool {
    true
}

/// One node of a regression tree, stored in a flat arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        split_feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
        #[serde(default = "default_true")]
        default_left: bool,
        /// Training weight that reached this node.
        cover: f64,
    },
    Leaf {
        leaf: f64,
        cover: f64,
    },
}

impl TreeNode {
    pub fn cover(&self) -> f64 {
        match self {
            TreeNode::Split { cover, .. } | TreeNode::Leaf { cover, .. } => *cover,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    #[serde(default)]
    pub class_id: usize,
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Child taken by `x` at split node `idx`.
    ///
    /// Callers only pass split nodes; a leaf returns itself.
    #[inline]
    pub fn next(&self, idx: usize, x: &[f32]) -> usize {
        match &self.nodes[idx] {
            TreeNode::Split {
                split_feature,
                threshold,
                left,
                right,
                default_left,
                ..
            } => {
                let v = x[*split_feature];
                if v.is_nan() {
                    if *default_left {
                        *left
                    } else {
                        *right
                    }
                } else if v < *threshold {
                    *left
                } else {
                    *right
                }
            }
            TreeNode::Leaf { .. } => idx,
        }
    }

    /// Leaf value reached by `x`.
    pub fn predict(&self, x: &[f32]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { leaf, .. } => return *leaf,
                TreeNode::Split { .. } => idx = self.next(idx, x),
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(tree: &Tree, idx: usize) -> usize {
            match &tree.nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => {
                    1 + walk(tree, *left).max(walk(tree, *right))
                }
            }
        }
        walk(self, 0)
    }
}

/// The loaded classifier. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub num_features: usize,
    pub num_classes: usize,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    /// Parse and validate a JSON artifact.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let model: TreeEnsemble =
            serde_json::from_slice(json).wrap_err("model artifact is not a valid tree ensemble")?;
        model.validate()?;
        Ok(model)
    }

    /// Number of margin groups: 1 for binary logistic models, otherwise
    /// `num_classes`.
    pub fn num_groups(&self) -> usize {
        if self.num_classes == 2 && self.trees.iter().all(|t| t.class_id == 0) {
            1
        } else {
            self.num_classes
        }
    }

    /// Margin group explained for a predicted class.
    pub fn group_for_class(&self, class_id: u32) -> usize {
        if self.num_groups() == 1 {
            0
        } else {
            class_id as usize
        }
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(Tree::depth).max().unwrap_or(0)
    }

    /// Structural checks run once at load time so that scoring can index
    /// without bounds surprises.
    pub fn validate(&self) -> Result<()> {
        if self.num_features == 0 {
            eyre::bail!("model declares zero input features");
        }
        if self.num_classes < 2 {
            eyre::bail!("model must have at least 2 classes, got {}", self.num_classes);
        }
        if self.trees.is_empty() {
            eyre::bail!("model contains no trees");
        }
        if !self.base_score.is_finite() {
            eyre::bail!("base_score must be finite");
        }
        let groups = self.num_groups();
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                eyre::bail!("tree {} has no nodes", t);
            }
            if tree.class_id >= groups {
                eyre::bail!(
                    "tree {} belongs to class group {} but the model has {} groups",
                    t,
                    tree.class_id,
                    groups
                );
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                let cover = node.cover();
                if !(cover.is_finite() && cover > 0.0) {
                    eyre::bail!("tree {} node {} has non-positive cover {}", t, i, cover);
                }
                match node {
                    TreeNode::Split {
                        split_feature,
                        threshold,
                        left,
                        right,
                        ..
                    } => {
                        if *split_feature >= self.num_features {
                            eyre::bail!(
                                "tree {} node {} splits on feature {} (model has {})",
                                t,
                                i,
                                split_feature,
                                self.num_features
                            );
                        }
                        if threshold.is_nan() {
                            eyre::bail!("tree {} node {} has a NaN threshold", t, i);
                        }
                        for child in [*left, *right] {
                            if child <= i || child >= tree.nodes.len() {
                                eyre::bail!(
                                    "tree {} node {} has invalid child index {}",
                                    t,
                                    i,
                                    child
                                );
                            }
                        }
                    }
                    TreeNode::Leaf { leaf, .. } => {
                        if !leaf.is_finite() {
                            eyre::bail!("tree {} node {} has a non-finite leaf value", t, i);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_input(&self, x: &[f32]) -> PredictResult<()> {
        if x.len() != self.num_features {
            return Err(PredictError::inference(format!(
                "model expects {} features, got {}",
                self.num_features,
                x.len()
            )));
        }
        Ok(())
    }

    /// Raw margin per group.
    pub fn margins(&self, x: &[f32]) -> PredictResult<Vec<f64>> {
        self.check_input(x)?;
        let mut margins = vec![self.base_score; self.num_groups()];
        for tree in &self.trees {
            margins[tree.class_id] += tree.predict(x);
        }
        Ok(margins)
    }

    /// Most likely class. Ties resolve to the lowest class id.
    pub fn predict_class(&self, x: &[f32]) -> PredictResult<u32> {
        let margins = self.margins(x)?;
        if margins.iter().any(|m| !m.is_finite()) {
            return Err(PredictError::inference("model produced a non-finite margin"));
        }
        if margins.len() == 1 {
            return Ok(u32::from(margins[0] > 0.0));
        }
        let mut best = 0;
        for (i, m) in margins.iter().enumerate().skip(1) {
            if *m > margins[best] {
                best = i;
            }
        }
        Ok(best as u32)
    }
}
