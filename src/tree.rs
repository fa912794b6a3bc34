use log::trace;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{Point, Shape};

/// Upper bound on rejected draws when picking a pixel pair for a split test.
const MAX_PAIR_DRAWS: usize = 10_000;

/// Binary test on the intensity difference of two stage pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitTest {
    /// Index of the first pixel coordinate.
    pub first: u32,
    /// Index of the second pixel coordinate.
    pub second: u32,
    pub threshold: f32,
}

impl SplitTest {
    /// `true` routes to the left child.
    #[inline]
    pub fn goes_left(&self, intensities: &[f32]) -> bool {
        intensities[self.first as usize] - intensities[self.second as usize] > self.threshold
    }
}

/// A node in the regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Internal split node.
    Split { test: SplitTest, left: u32, right: u32 },
    /// Leaf node holding the mean residual of the training samples routed here.
    Leaf { residual: Shape },
}

/// Hyperparameters for growing a single tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParameters {
    pub max_depth: usize,
    pub num_split_tests: usize,
    /// Strength of the prior favouring nearby pixel pairs.
    pub exponential_lambda: f32,
}

/// One training sample as seen by a tree: the stage intensities and the
/// residual left to explain.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSample {
    pub intensities: Vec<f32>,
    pub residual: Shape,
}

/// Everything a tree needs to grow.
pub struct TreeTraining<'a> {
    pub samples: &'a [TreeSample],
    /// Stage pixel coordinates in mean-shape space, used for the proximity prior.
    pub pixel_positions: &'a [Point],
    pub num_landmarks: usize,
    pub params: TreeParameters,
}

/// A single regression tree.
///
/// The tree predicts a shape residual by:
/// 1. Starting at the root node
/// 2. At each split, comparing a pixel intensity difference against a threshold
/// 3. Going left if the difference exceeds the threshold, right otherwise
/// 4. Returning the residual stored at the reached leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

struct NodeSplit {
    test: SplitTest,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl RegressionTree {
    /// Create a new regression tree with the given nodes.
    /// Node 0 is the root.
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    /// Grow a tree top-down on the training residuals.
    ///
    /// Nodes stop splitting at `max_depth`, with fewer than two samples, or
    /// when no candidate test separates the samples. An empty sample set
    /// produces a single zero leaf.
    pub fn fit<R: Rng + ?Sized>(training: &TreeTraining<'_>, rng: &mut R) -> Self {
        let mut nodes = Vec::new();
        let indices: Vec<usize> = (0..training.samples.len()).collect();
        grow(&mut nodes, training, indices, 0, rng);
        Self { nodes }
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Index of the leaf node reached by `intensities`.
    pub fn leaf_index(&self, intensities: &[f32]) -> usize {
        let mut node_idx = 0usize;

        loop {
            match &self.nodes[node_idx] {
                TreeNode::Split { test, left, right } => {
                    node_idx = if test.goes_left(intensities) {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
                TreeNode::Leaf { .. } => return node_idx,
            }
        }
    }

    /// Traverse the tree and return a reference to the leaf residual.
    pub fn predict(&self, intensities: &[f32]) -> &Shape {
        match &self.nodes[self.leaf_index(intensities)] {
            TreeNode::Leaf { residual } => residual,
            TreeNode::Split { .. } => unreachable!("leaf_index always stops at a leaf"),
        }
    }

    /// Get the number of nodes in the tree.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, TreeNode::Leaf { .. }))
            .count()
    }

    /// Number of split levels on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        self.depth_from(0)
    }

    /// Structural check for deserialized trees: children point forward,
    /// split tests reference existing pixels, leaves match the landmark count.
    pub(crate) fn check(&self, num_landmarks: usize, num_pixels: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        let num_nodes = self.nodes.len();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split { test, left, right } => {
                    if test.first as usize >= num_pixels || test.second as usize >= num_pixels {
                        return Err(format!("node {} references a missing pixel", idx));
                    }
                    for &child in &[*left, *right] {
                        let child = child as usize;
                        if child <= idx || child >= num_nodes {
                            return Err(format!("node {} has invalid child {}", idx, child));
                        }
                    }
                }
                TreeNode::Leaf { residual } => {
                    if residual.num_landmarks() != num_landmarks {
                        return Err(format!(
                            "leaf {} has {} landmarks, expected {}",
                            idx,
                            residual.num_landmarks(),
                            num_landmarks
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn depth_from(&self, node_idx: usize) -> usize {
        match &self.nodes[node_idx] {
            TreeNode::Split { left, right, .. } => {
                1 + self
                    .depth_from(*left as usize)
                    .max(self.depth_from(*right as usize))
            }
            TreeNode::Leaf { .. } => 0,
        }
    }
}

fn grow<R: Rng + ?Sized>(
    nodes: &mut Vec<TreeNode>,
    training: &TreeTraining<'_>,
    indices: Vec<usize>,
    depth: usize,
    rng: &mut R,
) -> u32 {
    let id = nodes.len();

    if depth < training.params.max_depth && indices.len() >= 2 {
        if let Some(split) = best_split(training, &indices, rng) {
            // Reserve the slot so children get larger indices than their parent.
            nodes.push(TreeNode::Leaf {
                residual: Shape::zeros(0),
            });
            let left = grow(nodes, training, split.left, depth + 1, rng);
            let right = grow(nodes, training, split.right, depth + 1, rng);
            nodes[id] = TreeNode::Split {
                test: split.test,
                left,
                right,
            };
            return id as u32;
        }
    }

    nodes.push(TreeNode::Leaf {
        residual: mean_residual(training, &indices),
    });
    id as u32
}

fn mean_residual(training: &TreeTraining<'_>, indices: &[usize]) -> Shape {
    if indices.is_empty() {
        return Shape::zeros(training.num_landmarks);
    }
    let sum = residual_sum(training, indices);
    let inv = 1.0 / indices.len() as f64;
    let flat: Vec<f32> = sum.iter().map(|v| (v * inv) as f32).collect();
    Shape::from_flat_vec(&flat)
}

fn residual_sum(training: &TreeTraining<'_>, indices: &[usize]) -> Vec<f64> {
    let mut sum = vec![0.0f64; 2 * training.num_landmarks];
    for &i in indices {
        accumulate(&mut sum, &training.samples[i].residual);
    }
    sum
}

#[inline]
fn accumulate(sum: &mut [f64], residual: &Shape) {
    for (k, p) in residual.points.iter().enumerate() {
        sum[2 * k] += p.x as f64;
        sum[2 * k + 1] += p.y as f64;
    }
}

#[inline]
fn squared_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Score random split tests and keep the one with the largest reduction of
/// the squared residual error. Tests that leave a child empty are ignored.
fn best_split<R: Rng + ?Sized>(
    training: &TreeTraining<'_>,
    indices: &[usize],
    rng: &mut R,
) -> Option<NodeSplit> {
    if training.pixel_positions.is_empty() {
        return None;
    }

    let n = indices.len();
    let total = residual_sum(training, indices);
    let mut diffs = Vec::with_capacity(n);
    let mut left_sum = vec![0.0f64; total.len()];
    let mut right_sum = vec![0.0f64; total.len()];
    let mut best: Option<(f64, SplitTest)> = None;

    for _ in 0..training.params.num_split_tests {
        let (first, second) = sample_pixel_pair(
            training.pixel_positions,
            training.params.exponential_lambda,
            rng,
        );

        diffs.clear();
        diffs.extend(indices.iter().map(|&i| {
            let intensities = &training.samples[i].intensities;
            intensities[first] - intensities[second]
        }));
        let (lo, hi) = diffs
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| {
                (lo.min(d), hi.max(d))
            });
        let threshold = lo + rng.random::<f32>() * (hi - lo);

        left_sum.iter_mut().for_each(|v| *v = 0.0);
        let mut left_count = 0usize;
        for (&i, &d) in indices.iter().zip(&diffs) {
            if d > threshold {
                accumulate(&mut left_sum, &training.samples[i].residual);
                left_count += 1;
            }
        }
        let right_count = n - left_count;
        if left_count == 0 || right_count == 0 {
            continue;
        }

        for ((r, t), l) in right_sum.iter_mut().zip(&total).zip(&left_sum) {
            *r = t - l;
        }
        let score = squared_norm(&left_sum) / left_count as f64
            + squared_norm(&right_sum) / right_count as f64;

        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((
                score,
                SplitTest {
                    first: first as u32,
                    second: second as u32,
                    threshold,
                },
            ));
        }
    }

    let (score, test) = best?;
    trace!(
        "split {} - {} > {:.3} on {} samples (score {:.4})",
        test.first,
        test.second,
        test.threshold,
        n,
        score
    );

    let (left, right) = indices
        .iter()
        .copied()
        .partition(|&i| test.goes_left(&training.samples[i].intensities));
    Some(NodeSplit { test, left, right })
}

/// Draw two pixel indices with probability proportional to
/// `exp(-lambda * distance)` between them.
fn sample_pixel_pair<R: Rng + ?Sized>(positions: &[Point], lambda: f32, rng: &mut R) -> (usize, usize) {
    let n = positions.len();
    if n < 2 {
        return (0, 0);
    }

    let mut pair = (0, 1);
    for _ in 0..MAX_PAIR_DRAWS {
        let i = rng.random_range(0..n);
        let j = rng.random_range(0..n);
        if i == j {
            continue;
        }
        pair = (i, j);
        let accept = (-lambda * positions[i].distance(&positions[j])).exp();
        if rng.random::<f32>() < accept {
            break;
        }
    }
    pair
}
