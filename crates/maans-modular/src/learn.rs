//! Tree learner: the training-sample store and the splitting heuristic that
//! turns gathered `(properties, residuals)` columns into an MA tree.

use maans_bitstream::pack_signed;
use maans_coding::IntegerConfig;

use crate::ma::{Tree, TreeNode};
use crate::param::ModularOptions;
use crate::predictor::Predictor;
use crate::{NUM_STATIC_PROPERTIES, WP_PROP, WP_PROP_RANGE};

/// Inclusive-exclusive bounds per static property; `[_, 0]` means unbounded.
pub type StaticPropRange = [[u32; 2]; 2];

/// A multiplier the learner may assign to leaves whose residuals it divides.
#[derive(Debug, Clone, Copy)]
pub struct ModularMultiplierInfo {
    pub range: StaticPropRange,
    pub multiplier: u32,
}

/// Column-major training samples: `props[property][sample]` and
/// `residuals[predictor][sample]`. This shape keeps the split-finding inner
/// loop contiguous.
#[derive(Debug, Default)]
pub struct TreeSamples {
    pub props: Vec<Vec<i32>>,
    pub residuals: Vec<Vec<i32>>,
}

impl TreeSamples {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ensure_shape(&mut self, num_props: usize, num_predictors: usize) {
        if self.props.is_empty() {
            self.props = vec![Vec::new(); num_props];
            self.residuals = vec![Vec::new(); num_predictors];
        }
        assert_eq!(self.props.len(), num_props);
        assert_eq!(self.residuals.len(), num_predictors);
    }

    pub fn num_samples(&self) -> usize {
        self.props.first().map_or(0, Vec::len)
    }
}

const MAX_PROPERTY_VALUES: usize = 256;
const MAX_DEPTH: usize = 10;
const PRESCORE_THRESHOLDS: usize = 15;

/// Builds an MA tree from gathered samples.
///
/// The candidate predictor with the smallest summed `pack_signed` residual
/// cost becomes the base predictor; splits are accepted when the estimated
/// entropy saving exceeds `node_threshold` scaled by the sampled pixel
/// fraction.
pub fn learn_tree(
    mut predictors: Vec<Predictor>,
    samples: TreeSamples,
    total_pixels: usize,
    options: &ModularOptions,
    multiplier_info: &[ModularMultiplierInfo],
    mut static_prop_range: StaticPropRange,
) -> Tree {
    for range in &mut static_prop_range {
        if range[1] == 0 {
            range[1] = u32::MAX;
        }
    }

    let TreeSamples {
        mut props,
        mut residuals,
    } = samples;

    if residuals.len() > 1 && !residuals[0].is_empty() {
        let mut base_pred = 0;
        let mut base_pred_cost = 0u64;
        for (i, res) in residuals.iter().enumerate() {
            let cost: u64 = res.iter().map(|&r| pack_signed(r) as u64).sum();
            if i == 0 || cost < base_pred_cost {
                base_pred = i;
                base_pred_cost = cost;
            }
        }
        predictors.swap(0, base_pred);
        residuals.swap(0, base_pred);
    }

    if residuals.is_empty() || residuals[0].is_empty() {
        return vec![TreeNode::leaf(0, *predictors.last().unwrap(), 0, 1)];
    }

    if options.force_wp_only {
        for v in &mut props[WP_PROP] {
            *v = (*v).clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1);
        }
    }
    if options.force_no_wp {
        for v in &mut props[WP_PROP] {
            *v = 0;
        }
        if let Some(pos) = predictors.iter().position(|&p| p == Predictor::Weighted) {
            debug_assert!(predictors.len() > 1, "caller must check force_no_wp");
            let last = predictors.len() - 1;
            predictors.swap(pos, last);
            residuals.swap(pos, last);
            predictors.pop();
            residuals.pop();
        }
    }

    let num_samples = residuals[0].len();
    let config = IntegerConfig::new(4, 1, 0);
    let costs: Vec<TokenColumn> = residuals
        .iter()
        .map(|res| TokenColumn::build(res, &config))
        .collect();

    let (props_to_use, thresholds) =
        choose_and_quantize_properties(&props, &costs[0], options, &static_prop_range);

    let pixel_fraction = num_samples as f32 / total_pixels.max(1) as f32;
    let split_threshold =
        options.splitting_heuristics_node_threshold * (0.9 * pixel_fraction + 0.1);

    let builder = TreeBuilder {
        props: &props,
        residuals: &residuals,
        predictors: &predictors,
        costs: &costs,
        props_to_use: &props_to_use,
        thresholds: &thresholds,
        split_threshold,
        fast_decode_multiplier: options.fast_decode_multiplier,
        multiplier_info,
    };
    let mut tree = Tree::new();
    let indices: Vec<u32> = (0..num_samples as u32).collect();
    builder.build(&mut tree, indices, 0);
    tree
}

/// Residuals of one predictor, pre-split into hybrid-uint symbols and extra
/// bit counts.
struct TokenColumn {
    symbols: Vec<u8>,
    nbits: Vec<u8>,
}

impl TokenColumn {
    fn build(residuals: &[i32], config: &IntegerConfig) -> Self {
        let mut symbols = Vec::with_capacity(residuals.len());
        let mut nbits = Vec::with_capacity(residuals.len());
        for &r in residuals {
            let (symbol, n, _) = config.token_split(pack_signed(r));
            symbols.push(symbol as u8);
            nbits.push(n as u8);
        }
        Self { symbols, nbits }
    }

    fn count(&self, indices: &[u32]) -> ([u32; 128], u64) {
        let mut counts = [0u32; 128];
        let mut extra = 0u64;
        for &i in indices {
            counts[self.symbols[i as usize] as usize] += 1;
            extra += self.nbits[i as usize] as u64;
        }
        (counts, extra)
    }

    fn cost(&self, indices: &[u32]) -> f32 {
        let (counts, extra) = self.count(indices);
        entropy_bits(&counts, extra, indices.len())
    }
}

fn entropy_bits(counts: &[u32; 128], extra: u64, total: usize) -> f32 {
    let total = total as f32;
    let mut bits = extra as f32;
    for &c in counts.iter() {
        if c > 0 {
            bits += c as f32 * (total / c as f32).log2();
        }
    }
    bits
}

/// Picks up to `splitting_heuristics_max_properties` properties, ranked by
/// their best single-split gain on the base predictor, and a quantized
/// threshold list per picked property.
fn choose_and_quantize_properties(
    props: &[Vec<i32>],
    base: &TokenColumn,
    options: &ModularOptions,
    static_prop_range: &StaticPropRange,
) -> (Vec<usize>, Vec<Vec<i32>>) {
    let num_samples = props.first().map_or(0, Vec::len);
    let all: Vec<u32> = (0..num_samples as u32).collect();
    let base_cost = base.cost(&all);
    let (base_counts, base_extra) = base.count(&all);

    let mut thresholds = vec![Vec::new(); props.len()];
    let mut scored: Vec<(f32, usize)> = Vec::new();
    for (p, values) in props.iter().enumerate() {
        let quantized = quantize_thresholds(values, static_prop_range, p);
        if quantized.is_empty() {
            continue;
        }

        // rough ranking: the best of a few evenly spaced thresholds
        let stride = (quantized.len() / PRESCORE_THRESHOLDS).max(1);
        let mut best = f32::INFINITY;
        for &threshold in quantized.iter().step_by(stride) {
            let cost = split_cost(
                base,
                values,
                &all,
                threshold,
                &base_counts,
                base_extra,
            );
            best = best.min(cost);
        }
        if base_cost - best > 0.0 {
            scored.push((base_cost - best, p));
        }
        thresholds[p] = quantized;
    }

    if options.force_wp_only {
        let props_to_use = if thresholds[WP_PROP].is_empty() {
            Vec::new()
        } else {
            vec![WP_PROP]
        };
        return (props_to_use, thresholds);
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));
    let props_to_use: Vec<usize> = scored
        .iter()
        .take(options.splitting_heuristics_max_properties)
        .map(|&(_, p)| p)
        .collect();
    (props_to_use, thresholds)
}

fn quantize_thresholds(
    values: &[i32],
    static_prop_range: &StaticPropRange,
    property: usize,
) -> Vec<i32> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if let Some(range) = (property < NUM_STATIC_PROPERTIES)
        .then(|| static_prop_range[property])
    {
        sorted.retain(|&v| (v as i64) >= range[0] as i64 && (v as i64) < range[1] as i64);
    }
    // the largest value cannot be a useful `>` threshold
    sorted.pop();
    if sorted.len() > MAX_PROPERTY_VALUES {
        let stride = sorted.len() as f64 / MAX_PROPERTY_VALUES as f64;
        (0..MAX_PROPERTY_VALUES)
            .map(|i| sorted[(i as f64 * stride) as usize])
            .collect()
    } else {
        sorted
    }
}

/// Cost of splitting `indices` at `values > threshold`, with the right-side
/// histogram derived by subtraction.
fn split_cost(
    column: &TokenColumn,
    values: &[i32],
    indices: &[u32],
    threshold: i32,
    node_counts: &[u32; 128],
    node_extra: u64,
) -> f32 {
    let mut left_counts = [0u32; 128];
    let mut left_extra = 0u64;
    let mut left_total = 0usize;
    for &i in indices {
        if values[i as usize] > threshold {
            left_counts[column.symbols[i as usize] as usize] += 1;
            left_extra += column.nbits[i as usize] as u64;
            left_total += 1;
        }
    }
    let mut right_counts = [0u32; 128];
    for (r, (&n, &l)) in right_counts
        .iter_mut()
        .zip(node_counts.iter().zip(left_counts.iter()))
    {
        *r = n - l;
    }
    let right_extra = node_extra - left_extra;
    let right_total = indices.len() - left_total;
    entropy_bits(&left_counts, left_extra, left_total)
        + entropy_bits(&right_counts, right_extra, right_total)
}

struct TreeBuilder<'a> {
    props: &'a [Vec<i32>],
    residuals: &'a [Vec<i32>],
    predictors: &'a [Predictor],
    costs: &'a [TokenColumn],
    props_to_use: &'a [usize],
    thresholds: &'a [Vec<i32>],
    split_threshold: f32,
    fast_decode_multiplier: f32,
    multiplier_info: &'a [ModularMultiplierInfo],
}

impl TreeBuilder<'_> {
    fn build(&self, tree: &mut Tree, indices: Vec<u32>, depth: usize) -> u32 {
        let idx = tree.len() as u32;
        tree.push(TreeNode::leaf(0, self.predictors[0], 0, 1));

        let (best_pred, node_cost) = self.best_predictor(&indices);

        let mut best_split: Option<(usize, i32, f32)> = None;
        if depth < MAX_DEPTH && indices.len() >= 4 {
            let column = &self.costs[best_pred];
            let (node_counts, node_extra) = column.count(&indices);
            for &p in self.props_to_use {
                let values = &self.props[p];
                for &threshold in &self.thresholds[p] {
                    let cost =
                        split_cost(column, values, &indices, threshold, &node_counts, node_extra);
                    if best_split.map_or(true, |(_, _, c)| cost < c) {
                        best_split = Some((p, threshold, cost));
                    }
                }
            }
        }

        match best_split {
            Some((property, threshold, cost))
                if node_cost - cost > self.split_threshold =>
            {
                let values = &self.props[property];
                let (left, right): (Vec<u32>, Vec<u32>) = indices
                    .into_iter()
                    .partition(|&i| values[i as usize] > threshold);
                if left.is_empty() || right.is_empty() {
                    // every sample on one side; the split is void
                    let all = if left.is_empty() { right } else { left };
                    self.leaf_at(tree, idx, best_pred, &all);
                    return idx;
                }
                let lchild = self.build(tree, left, depth + 1);
                let rchild = self.build(tree, right, depth + 1);
                tree[idx as usize] =
                    TreeNode::decision(property as i32, threshold, lchild, rchild);
            }
            _ => self.leaf_at(tree, idx, best_pred, &indices),
        }
        idx
    }

    fn best_predictor(&self, indices: &[u32]) -> (usize, f32) {
        let mut best = 0usize;
        let mut best_cost = f32::INFINITY;
        for (i, column) in self.costs.iter().enumerate() {
            let mut cost = column.cost(indices);
            if self.predictors[i] == Predictor::Weighted {
                cost *= self.fast_decode_multiplier;
            }
            if cost < best_cost {
                best = i;
                best_cost = cost;
            }
        }
        (best, best_cost)
    }

    fn leaf_at(&self, tree: &mut Tree, idx: u32, pred: usize, indices: &[u32]) {
        let residuals = &self.residuals[pred];
        let multiplier = self
            .multiplier_info
            .iter()
            .map(|info| info.multiplier)
            .find(|&m| {
                m > 1 && indices.iter().all(|&i| residuals[i as usize] % m as i32 == 0)
            })
            .unwrap_or(1);
        tree[idx as usize] = TreeNode::leaf(0, self.predictors[pred], 0, multiplier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PredictorChoice;

    fn options() -> ModularOptions {
        ModularOptions {
            predictor: PredictorChoice::Variable,
            ..ModularOptions::default()
        }
    }

    fn full_range() -> StaticPropRange {
        [[0, 0], [0, 0]]
    }

    #[test]
    fn empty_samples_give_single_leaf_of_last_predictor() {
        let tree = learn_tree(
            vec![Predictor::Gradient, Predictor::Left],
            TreeSamples::new(),
            0,
            &options(),
            &[],
            full_range(),
        );
        assert_eq!(tree.len(), 1);
        assert!(tree[0].is_leaf());
        assert_eq!(tree[0].predictor, Predictor::Left);
        assert_eq!(tree[0].multiplier, 1);
        assert_eq!(tree[0].predictor_offset, 0);
    }

    #[test]
    fn splits_on_a_discriminating_property() {
        // property 9 separates two residual populations perfectly
        let mut samples = TreeSamples::new();
        samples.props = vec![Vec::new(); crate::NUM_NONREF_PROPERTIES];
        samples.residuals = vec![Vec::new()];
        for i in 0..512 {
            let group = i % 2;
            for (p, column) in samples.props.iter_mut().enumerate() {
                column.push(if p == 9 { group as i32 * 100 } else { 0 });
            }
            samples.residuals[0].push(if group == 0 { 0 } else { 900 + (i as i32 % 4) });
        }
        let tree = learn_tree(
            vec![Predictor::Gradient],
            samples,
            512,
            &options(),
            &[],
            full_range(),
        );
        assert!(tree.len() >= 3, "expected at least one split, got {:?}", tree);
        assert_eq!(tree[0].property, 9);
    }

    #[test]
    fn base_predictor_has_smallest_packed_cost() {
        let mut samples = TreeSamples::new();
        samples.props = vec![vec![0; 64]; crate::NUM_NONREF_PROPERTIES];
        // predictor 0 leaves huge residuals, predictor 1 zero residuals
        samples.residuals = vec![vec![1000; 64], vec![0; 64]];
        let tree = learn_tree(
            vec![Predictor::Zero, Predictor::Gradient],
            samples,
            64,
            &options(),
            &[],
            full_range(),
        );
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].predictor, Predictor::Gradient);
    }

    #[test]
    fn force_no_wp_removes_weighted_candidate() {
        let mut samples = TreeSamples::new();
        samples.props = vec![vec![0; 32]; crate::NUM_NONREF_PROPERTIES];
        samples.residuals = vec![vec![0; 32], vec![0; 32]];
        let opts = ModularOptions {
            force_no_wp: true,
            ..options()
        };
        let tree = learn_tree(
            vec![Predictor::Weighted, Predictor::Gradient],
            samples,
            32,
            &opts,
            &[],
            full_range(),
        );
        for node in &tree {
            assert_ne!(node.predictor, Predictor::Weighted);
        }
    }

    #[test]
    fn force_wp_only_splits_only_on_wp_property() {
        let mut samples = TreeSamples::new();
        samples.props = vec![Vec::new(); crate::NUM_NONREF_PROPERTIES];
        samples.residuals = vec![Vec::new()];
        for i in 0..512i32 {
            for (p, column) in samples.props.iter_mut().enumerate() {
                let v = match p {
                    WP_PROP => (i % 2) * 2000 - 1000, // clamped to the wp range
                    9 => i,
                    _ => 0,
                };
                column.push(v);
            }
            samples.residuals[0].push((i % 2) * 500);
        }
        let opts = ModularOptions {
            force_wp_only: true,
            ..options()
        };
        let tree = learn_tree(
            vec![Predictor::Weighted],
            samples,
            512,
            &opts,
            &[],
            full_range(),
        );
        for node in &tree {
            if !node.is_leaf() {
                assert_eq!(node.property as usize, WP_PROP);
                assert!(node.splitval >= -WP_PROP_RANGE && node.splitval < WP_PROP_RANGE);
            }
        }
    }

    #[test]
    fn leaf_multiplier_divides_all_residuals() {
        let mut samples = TreeSamples::new();
        samples.props = vec![vec![0; 64]; crate::NUM_NONREF_PROPERTIES];
        samples.residuals = vec![(0..64).map(|i| i * 24).collect()];
        let info = ModularMultiplierInfo {
            range: full_range(),
            multiplier: 8,
        };
        let tree = learn_tree(
            vec![Predictor::Zero],
            samples,
            64,
            &options(),
            &[info],
            full_range(),
        );
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].multiplier, 8);
    }
}
