//! Spatial predictors, the weighted predictor state machine, and property
//! vector computation.

use crate::ma::{tree_lookup, FlatDecisionNode};
use crate::{Image, NUM_MODULAR_PREDICTORS, NUM_NONREF_PROPERTIES, WP_PROP};

/// Spatial predictors. The integer ordering is part of the wire format.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(u8)]
pub enum Predictor {
    #[default]
    Zero = 0,
    Left,
    Top,
    Average,
    Select,
    Gradient,
    Weighted,
    NorthEast,
    NorthWest,
    WestWest,
    Average2,
    Average3,
    Average4,
    AverageAll,
}

impl TryFrom<u32> for Predictor {
    type Error = maans_bitstream::Error;

    fn try_from(value: u32) -> maans_bitstream::Result<Self> {
        use Predictor::*;
        Ok(match value {
            0 => Zero,
            1 => Left,
            2 => Top,
            3 => Average,
            4 => Select,
            5 => Gradient,
            6 => Weighted,
            7 => NorthEast,
            8 => NorthWest,
            9 => WestWest,
            10 => Average2,
            11 => Average3,
            12 => Average4,
            13 => AverageAll,
            _ => {
                return Err(maans_bitstream::Error::InvalidEnum {
                    name: "Predictor",
                    value,
                })
            }
        })
    }
}

impl Predictor {
    pub(crate) fn all() -> [Predictor; NUM_MODULAR_PREDICTORS] {
        use Predictor::*;
        [
            Zero, Left, Top, Average, Select, Gradient, Weighted, NorthEast, NorthWest, WestWest,
            Average2, Average3, Average4, AverageAll,
        ]
    }

    /// Evaluates this predictor on the sampled neighborhood. `Weighted` is
    /// driven by [`weighted::State`] instead.
    pub(crate) fn predict(self, neigh: &Neighborhood) -> i64 {
        use Predictor::*;
        match self {
            Zero => 0,
            Left => neigh.w,
            Top => neigh.n,
            Average => (neigh.w + neigh.n) / 2,
            Select => {
                let n = neigh.n;
                let w = neigh.w;
                let nw = neigh.nw;
                if n.abs_diff(nw) < w.abs_diff(nw) {
                    w
                } else {
                    n
                }
            }
            Gradient => {
                let n = neigh.n;
                let w = neigh.w;
                (w + n - neigh.nw).clamp(w.min(n), w.max(n))
            }
            Weighted => unreachable!("weighted predictor needs predictor state"),
            NorthEast => neigh.ne,
            NorthWest => neigh.nw,
            WestWest => neigh.ww,
            Average2 => (neigh.w + neigh.nw) / 2,
            Average3 => (neigh.n + neigh.nw) / 2,
            Average4 => (neigh.n + neigh.ne) / 2,
            AverageAll => {
                (6 * neigh.n - 2 * neigh.nn + 7 * neigh.w + neigh.ww + neigh.nee + 3 * neigh.ne
                    + 8)
                    / 16
            }
        }
    }
}

/// The sampled neighborhood of a pixel, with out-of-bounds defaults applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Neighborhood {
    pub n: i64,
    pub w: i64,
    pub nw: i64,
    pub ne: i64,
    pub nn: i64,
    pub ww: i64,
    pub nee: i64,
}

#[inline]
pub(crate) fn neighborhood(data: &[i32], width: usize, x: usize, y: usize) -> Neighborhood {
    let row = y * width;
    let w = if x > 0 {
        data[row + x - 1] as i64
    } else if y > 0 {
        data[row - width + x] as i64
    } else {
        0
    };
    let n = if y > 0 { data[row - width + x] as i64 } else { w };
    let nw = if x > 0 && y > 0 {
        data[row - width + x - 1] as i64
    } else {
        w
    };
    let ne = if x + 1 < width && y > 0 {
        data[row - width + x + 1] as i64
    } else {
        n
    };
    let nn = if y > 1 {
        data[row - 2 * width + x] as i64
    } else {
        n
    };
    let ww = if x > 1 { data[row + x - 2] as i64 } else { w };
    let nee = if x + 2 < width && y > 0 {
        data[row - width + x + 2] as i64
    } else {
        ne
    };
    Neighborhood {
        n,
        w,
        nw,
        ne,
        nn,
        ww,
        nee,
    }
}

#[inline]
pub(crate) fn sat_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Sets the per-row property slots: the static properties and `y`.
pub(crate) fn init_props_row(props: &mut [i32], static_props: [i32; 2], y: usize) {
    props[0] = static_props[0];
    props[1] = static_props[1];
    props[2] = y as i32;
}

/// Fills the per-pixel property slots from the neighborhood and the
/// precomputed reference row. The weighted predictor property (slot
/// [`WP_PROP`]) is left to the caller.
pub(crate) fn compute_properties(
    props: &mut [i32],
    neigh: &Neighborhood,
    x: usize,
    prev_grad: i64,
    refs: &[i32],
) {
    props[3] = x as i32;
    props[4] = sat_i32(neigh.n.abs());
    props[5] = sat_i32(neigh.w.abs());
    props[6] = sat_i32(neigh.n);
    props[7] = sat_i32(neigh.w);
    props[8] = sat_i32(neigh.w - prev_grad);
    props[9] = sat_i32(neigh.w + neigh.n - neigh.nw);
    props[10] = sat_i32(neigh.w - neigh.nw);
    props[11] = sat_i32(neigh.nw - neigh.n);
    props[12] = sat_i32(neigh.n - neigh.ne);
    props[13] = sat_i32(neigh.n - neigh.nn);
    props[14] = sat_i32(neigh.w - neigh.ww);
    props[NUM_NONREF_PROPERTIES..NUM_NONREF_PROPERTIES + refs.len()].copy_from_slice(refs);
}

/// Fills one row of reference-channel properties: for each prior channel
/// with matching geometry (closest first), the sample, its magnitude, and
/// its signed/absolute deviation from the channel's own clamped gradient.
pub(crate) fn precompute_references(
    image: &Image,
    chan: usize,
    chan_w: usize,
    chan_h: usize,
    hshift: i32,
    vshift: i32,
    y: usize,
    out: &mut [i32],
) {
    out.fill(0);
    let num_extra = out.len() / chan_w.max(1);
    let mut offset = 0usize;
    for rc in image.channel[..chan].iter().rev() {
        if offset + crate::EXTRA_PROPS_PER_CHANNEL > num_extra {
            break;
        }
        if rc.w != chan_w || rc.h != chan_h || rc.hshift != hshift || rc.vshift != vshift {
            continue;
        }
        let row = rc.row(y);
        let row_above = (y > 0).then(|| rc.row(y - 1));
        for x in 0..chan_w {
            let c = row[x] as i64;
            let w = if x > 0 { row[x - 1] as i64 } else { 0 };
            let n = match row_above {
                Some(above) => above[x] as i64,
                None => w,
            };
            let nw = if x > 0 {
                match row_above {
                    Some(above) => above[x - 1] as i64,
                    None => w,
                }
            } else {
                0
            };
            let g = (w + n - nw).clamp(w.min(n), w.max(n));
            let slot = &mut out[x * num_extra + offset..];
            slot[0] = sat_i32(c.abs());
            slot[1] = sat_i32(c);
            slot[2] = sat_i32((c - g).abs());
            slot[3] = sat_i32(c - g);
        }
        offset += crate::EXTRA_PROPS_PER_CHANNEL;
    }
}

/// Prediction output of a tree lookup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PredictionResult {
    /// Predictor guess with the leaf offset folded in.
    pub guess: i64,
    pub multiplier: u32,
    pub context: u32,
    pub predictor: Predictor,
}

pub(crate) fn predict_no_tree_no_wp(
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    predictor: Predictor,
) -> i64 {
    predictor.predict(&neighborhood(data, width, x, y))
}

pub(crate) fn predict_no_tree_wp(
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    predictor: Predictor,
    wp: &mut weighted::State,
) -> i64 {
    let neigh = neighborhood(data, width, x, y);
    let (wp_guess, _) = wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
    if predictor == Predictor::Weighted {
        wp_guess
    } else {
        predictor.predict(&neigh)
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn predict_tree_no_wp(
    props: &mut [i32],
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    tree: &[FlatDecisionNode],
    refs: &[i32],
    prev_grad: &mut i64,
) -> PredictionResult {
    let neigh = neighborhood(data, width, x, y);
    compute_properties(props, &neigh, x, *prev_grad, refs);
    props[WP_PROP] = 0;
    *prev_grad = neigh.w + neigh.n - neigh.nw;
    let leaf = tree_lookup(tree, props);
    debug_assert!(leaf.predictor != Predictor::Weighted);
    PredictionResult {
        guess: leaf.predictor.predict(&neigh) + leaf.predictor_offset,
        multiplier: leaf.multiplier,
        context: leaf.child_id,
        predictor: leaf.predictor,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn predict_tree_wp(
    props: &mut [i32],
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    tree: &[FlatDecisionNode],
    refs: &[i32],
    prev_grad: &mut i64,
    wp: &mut weighted::State,
) -> PredictionResult {
    let neigh = neighborhood(data, width, x, y);
    compute_properties(props, &neigh, x, *prev_grad, refs);
    let (wp_guess, wp_prop) = wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
    props[WP_PROP] = wp_prop;
    *prev_grad = neigh.w + neigh.n - neigh.nw;
    let leaf = tree_lookup(tree, props);
    let guess = if leaf.predictor == Predictor::Weighted {
        wp_guess
    } else {
        leaf.predictor.predict(&neigh)
    };
    PredictionResult {
        guess: guess + leaf.predictor_offset,
        multiplier: leaf.multiplier,
        context: leaf.child_id,
        predictor: leaf.predictor,
    }
}

/// Computes the property vector and the guess of a single candidate
/// predictor, driving the weighted predictor state either way.
#[allow(clippy::too_many_arguments)]
pub(crate) fn predict_learn(
    props: &mut [i32],
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    predictor: Predictor,
    refs: &[i32],
    prev_grad: &mut i64,
    wp: &mut weighted::State,
) -> i64 {
    let neigh = neighborhood(data, width, x, y);
    compute_properties(props, &neigh, x, *prev_grad, refs);
    let (wp_guess, wp_prop) = wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
    props[WP_PROP] = wp_prop;
    *prev_grad = neigh.w + neigh.n - neigh.nw;
    if predictor == Predictor::Weighted {
        wp_guess
    } else {
        predictor.predict(&neigh)
    }
}

/// As [`predict_learn`], but evaluates every predictor at once.
#[allow(clippy::too_many_arguments)]
pub(crate) fn predict_learn_all(
    props: &mut [i32],
    data: &[i32],
    width: usize,
    x: usize,
    y: usize,
    refs: &[i32],
    prev_grad: &mut i64,
    wp: &mut weighted::State,
    guesses: &mut [i64; NUM_MODULAR_PREDICTORS],
) {
    let neigh = neighborhood(data, width, x, y);
    compute_properties(props, &neigh, x, *prev_grad, refs);
    let (wp_guess, wp_prop) = wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
    props[WP_PROP] = wp_prop;
    *prev_grad = neigh.w + neigh.n - neigh.nw;
    for (predictor, guess) in Predictor::all().into_iter().zip(guesses.iter_mut()) {
        *guess = if predictor == Predictor::Weighted {
            wp_guess
        } else {
            predictor.predict(&neigh)
        };
    }
}

pub mod weighted {
    //! The weighted (self-correcting) predictor: four sub-predictors
    //! combined by weights derived from a per-position ring of tracked
    //! errors.

    use crate::param::WpHeader;

    /// Number of properties the weighted predictor contributes.
    pub const NUM_PROPERTIES: usize = 1;

    const NUM_PREDICTORS: usize = 4;

    const DIV_LOOKUP: [u32; 65] = compute_div_lookup();

    const fn compute_div_lookup() -> [u32; 65] {
        let mut out = [0u32; 65];
        let mut i = 1usize;
        while i <= 64 {
            out[i] = ((1 << 24) / i) as u32;
            i += 1;
        }
        out
    }

    /// Per-channel weighted predictor state.
    ///
    /// `predict` is read-only with respect to the error rings; the rings
    /// advance only when `update_errors` records the true sample, so encoder
    /// and decoder stay in lockstep.
    #[derive(Debug)]
    pub struct State {
        wp: WpHeader,
        true_err_prev: Vec<i64>,
        true_err_curr: Vec<i64>,
        subpred_err_prev: Vec<[u32; NUM_PREDICTORS]>,
        subpred_err_curr: Vec<[u32; NUM_PREDICTORS]>,
        true_err_w: i64,
        true_err_n: i64,
        true_err_nw: i64,
        true_err_ne: i64,
        subpred_err_nw_ww: [u32; NUM_PREDICTORS],
        subpred_err_n_w: [u32; NUM_PREDICTORS],
        subpred_err_ne: [u32; NUM_PREDICTORS],
        subpred: [i64; NUM_PREDICTORS],
        prediction: i64,
    }

    impl State {
        pub fn new(wp: &WpHeader, width: usize) -> Self {
            Self {
                wp: wp.clone(),
                true_err_prev: Vec::with_capacity(width),
                true_err_curr: Vec::with_capacity(width),
                subpred_err_prev: Vec::with_capacity(width),
                subpred_err_curr: Vec::with_capacity(width),
                true_err_w: 0,
                true_err_n: 0,
                true_err_nw: 0,
                true_err_ne: 0,
                subpred_err_nw_ww: [0; NUM_PREDICTORS],
                subpred_err_n_w: [0; NUM_PREDICTORS],
                subpred_err_ne: [0; NUM_PREDICTORS],
                subpred: [0; NUM_PREDICTORS],
                prediction: 0,
            }
        }

        /// Predicts from the neighborhood and tracked errors. Returns the
        /// rounded guess and the "max weighted error" property, saturated to
        /// the property range.
        pub fn predict(&mut self, n: i64, w: i64, ne: i64, nw: i64, nn: i64) -> (i64, i32) {
            let n3 = n << 3;
            let nw3 = nw << 3;
            let ne3 = ne << 3;
            let w3 = w << 3;
            let nn3 = nn << 3;

            let wp = &self.wp;
            self.subpred = [
                w3 + ne3 - n3,
                n3 - (((self.true_err_w + self.true_err_n + self.true_err_ne)
                    * wp.wp_p1 as i64)
                    >> 5),
                w3 - (((self.true_err_w + self.true_err_n + self.true_err_nw)
                    * wp.wp_p2 as i64)
                    >> 5),
                n3 - ((self.true_err_nw * wp.wp_p3a as i64
                    + self.true_err_n * wp.wp_p3b as i64
                    + self.true_err_ne * wp.wp_p3c as i64
                    + (nn3 - n3) * wp.wp_p3d as i64
                    + (nw3 - w3) * wp.wp_p3e as i64)
                    >> 5),
            ];

            let max_weights = [wp.wp_w0, wp.wp_w1, wp.wp_w2, wp.wp_w3];
            let mut weight = [0u32; NUM_PREDICTORS];
            for i in 0..NUM_PREDICTORS {
                let err_sum = self.subpred_err_nw_ww[i] as u64
                    + self.subpred_err_n_w[i] as u64
                    + self.subpred_err_ne[i] as u64;
                let shift = floor_log2_u64(err_sum + 1).saturating_sub(5);
                weight[i] =
                    4 + ((max_weights[i] * DIV_LOOKUP[(err_sum >> shift) as usize + 1]) >> shift);
            }

            let sum_weights: u32 = weight.iter().copied().sum();
            let log_weight = floor_log2(sum_weights) - 4;
            for w in &mut weight {
                *w >>= log_weight;
            }
            let sum_weights: u32 = weight.iter().copied().sum();
            let mut s = (sum_weights as i64 >> 1) - 1;
            for (subpred, weight) in self.subpred.into_iter().zip(weight) {
                s += subpred * weight as i64;
            }
            let mut prediction = (s * DIV_LOOKUP[sum_weights as usize] as i64) >> 24;
            if (self.true_err_n ^ self.true_err_w) | (self.true_err_n ^ self.true_err_nw) <= 0 {
                let min = n3.min(w3).min(ne3);
                let max = n3.max(w3).max(ne3);
                prediction = prediction.clamp(min, max);
            }
            self.prediction = prediction;

            let mut max_error = self.true_err_w;
            for err in [self.true_err_n, self.true_err_nw, self.true_err_ne] {
                if err.abs() > max_error.abs() {
                    max_error = err;
                }
            }

            ((prediction + 3) >> 3, super::sat_i32(max_error))
        }

        /// Advances the error rings with the true decoded sample. Must be
        /// called exactly once per pixel, in raster order.
        pub fn update_errors(&mut self, sample: i64, x: usize, _y: usize, width: usize) {
            let sample3 = sample << 3;
            let true_err = self.prediction - sample3;
            let mut subpred_err = [0u32; NUM_PREDICTORS];
            for (err, subpred) in subpred_err.iter_mut().zip(self.subpred) {
                *err = (((subpred - sample3).unsigned_abs() + 3) >> 3).min(u32::MAX as u64) as u32;
            }

            self.true_err_curr.push(true_err);
            self.subpred_err_curr.push(subpred_err);
            debug_assert_eq!(self.true_err_curr.len(), x + 1);

            if x + 1 >= width {
                std::mem::swap(&mut self.true_err_prev, &mut self.true_err_curr);
                std::mem::swap(&mut self.subpred_err_prev, &mut self.subpred_err_curr);
                self.true_err_curr.clear();
                self.subpred_err_curr.clear();

                self.true_err_w = 0;
                self.true_err_n = self.true_err_prev[0];
                self.true_err_nw = self.true_err_n;
                self.subpred_err_n_w = self.subpred_err_prev[0];
                self.subpred_err_nw_ww = self.subpred_err_n_w;
                if width <= 1 {
                    self.true_err_ne = self.true_err_n;
                    self.subpred_err_ne = self.subpred_err_n_w;
                } else {
                    self.true_err_ne = self.true_err_prev[1];
                    self.subpred_err_ne = self.subpred_err_prev[1];
                }
            } else {
                self.true_err_w = true_err;
                self.true_err_nw = self.true_err_n;
                self.true_err_n = self.true_err_ne;
                self.subpred_err_nw_ww = self.subpred_err_n_w;
                self.subpred_err_n_w = self.subpred_err_ne;
                for (acc, err) in self.subpred_err_n_w.iter_mut().zip(subpred_err) {
                    *acc = acc.saturating_add(err);
                }

                let next_x = x + 1;
                if next_x + 1 >= width {
                    self.true_err_ne = self.true_err_n;
                    self.subpred_err_ne = self.subpred_err_n_w;
                } else if !self.true_err_prev.is_empty() {
                    self.true_err_ne = self.true_err_prev[next_x + 1];
                    self.subpred_err_ne = self.subpred_err_prev[next_x + 1];
                }
            }
        }
    }

    fn floor_log2(x: u32) -> u32 {
        u32::BITS - 1 - x.leading_zeros()
    }

    fn floor_log2_u64(x: u64) -> u32 {
        u64::BITS - 1 - x.leading_zeros()
    }
}
