//! Encoder: training-data gathering, per-channel token emission, and the
//! top-level compress entry point.

use maans_bitstream::{pack_signed, BitWriter};
use maans_coding::{build_and_encode_histograms, write_tokens, Token};

use crate::image::Image;
use crate::learn::{learn_tree, TreeSamples};
use crate::ma::{build_wp_only_tables, filter_tree, tokenize_tree, Tree};
use crate::param::{predictor_mode, GroupHeader, ModularOptions, PredictorChoice};
use crate::predictor::{
    self, init_props_row, precompute_references, predict_learn, predict_learn_all,
    predict_no_tree_no_wp, predict_tree_wp, weighted, Predictor,
};
use crate::{
    Error, Result, EXTRA_PROPS_PER_CHANNEL, NUM_MODULAR_PREDICTORS, NUM_NONREF_PROPERTIES,
    NUM_TREE_CONTEXTS, WP_PROP_RANGE,
};

/// Which track [`modular_generic_compress`] took for a channel. Exposed for
/// diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderPath {
    WpOnly,
    SingleZero,
    SingleNoWp,
    General,
}

/// Output destination of [`modular_generic_compress`], selecting one of the
/// three operating modes.
pub enum CompressOutput<'a> {
    /// Self-contained group: learn a local tree and write header, tree and
    /// tokens inline.
    Inline { writer: &'a mut BitWriter },
    /// Gather training samples for a global tree; nothing is written.
    Gather {
        samples: &'a mut TreeSamples,
        total_pixels: &'a mut usize,
    },
    /// Tokenize with a caller-provided global tree (in decoder view, as
    /// returned by [`tokenize_tree`]). The caller writes the filled header
    /// and entropy-codes the returned tokens with the shared code; `width`
    /// receives the widest coded channel for distribution sizing.
    Tokens {
        tree: &'a Tree,
        header: &'a mut GroupHeader,
        tokens: &'a mut Vec<Token>,
        width: &'a mut usize,
    },
}

/// The channels the iteration policy selects: skip leading and empty
/// channels, stop at the first oversized non-meta channel. Encoder and
/// decoder share this function, so they always agree on the channel set.
pub(crate) fn coded_channels(image: &Image, options: &ModularOptions) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, channel) in image
        .channel
        .iter()
        .enumerate()
        .skip(options.skipchannels)
    {
        if channel.w == 0 || channel.h == 0 {
            continue;
        }
        if i >= image.nb_meta_channels
            && (channel.w > options.max_chan_size || channel.h > options.max_chan_size)
        {
            break;
        }
        out.push(i);
    }
    out
}

pub(crate) fn candidate_predictors(options: &ModularOptions) -> Vec<Predictor> {
    match options.predictor {
        PredictorChoice::Variable => Predictor::all().to_vec(),
        PredictorChoice::Best => vec![Predictor::Gradient, Predictor::Weighted],
        PredictorChoice::Fixed(predictor) => vec![predictor],
    }
}

/// Encodes one channel against the (decoder-view) tree, appending one token
/// per pixel.
pub(crate) fn encode_modular_channel(
    image: &Image,
    chan: usize,
    wp_header: &crate::param::WpHeader,
    tree: &Tree,
    group_id: u32,
    tokens: &mut Vec<Token>,
) -> Result<EncoderPath> {
    let channel = &image.channel[chan];
    assert!(channel.w != 0 && channel.h != 0);
    let (w, h) = (channel.w, channel.h);
    let data = channel.data();

    tracing::trace!(
        w,
        h,
        chan,
        hshift = channel.hshift,
        vshift = channel.vshift,
        "encoding channel"
    );

    let static_props = [chan as i32, group_id as i32];
    let filtered = filter_tree(tree, static_props);
    let flat = &filtered.nodes;
    tracing::debug!(nodes = flat.len(), "encoding using a filtered MA tree");

    tokens.reserve(w * h);

    if filtered.wp_only {
        if let Some(tables) = build_wp_only_tables(flat, true) {
            tracing::trace!("wp fast track");
            let mut wp = weighted::State::new(wp_header, w);
            for y in 0..h {
                for x in 0..w {
                    let neigh = predictor::neighborhood(data, w, x, y);
                    let (guess, property) =
                        wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
                    let pos = (property.clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1)
                        + WP_PROP_RANGE) as usize;
                    let ctx = tables.context_lookup[pos] as u32;
                    let sample = data[y * w + x] as i64;
                    tokens.push(Token::new(ctx, pack_signed((sample - guess) as i32)));
                    wp.update_errors(sample, x, y, w);
                }
            }
            return Ok(EncoderPath::WpOnly);
        }
    }

    if flat.len() == 1
        && flat[0].predictor == Predictor::Zero
        && flat[0].multiplier == 1
        && flat[0].predictor_offset == 0
    {
        let ctx = flat[0].child_id;
        for &sample in data {
            tokens.push(Token::new(ctx, pack_signed(sample)));
        }
        return Ok(EncoderPath::SingleZero);
    }

    if flat.len() == 1
        && flat[0].predictor != Predictor::Weighted
        && flat[0].multiplier == 1
        && flat[0].predictor_offset == 0
    {
        let ctx = flat[0].child_id;
        let predictor = flat[0].predictor;
        for y in 0..h {
            for x in 0..w {
                let guess = predict_no_tree_no_wp(data, w, x, y, predictor);
                let residual = data[y * w + x] as i64 - guess;
                tokens.push(Token::new(ctx, pack_signed(residual as i32)));
            }
        }
        return Ok(EncoderPath::SingleNoWp);
    }

    let num_extra = filtered.num_props - NUM_NONREF_PROPERTIES;
    let mut references = vec![0i32; num_extra * w];
    let mut props = vec![0i32; filtered.num_props];
    let mut wp = weighted::State::new(wp_header, w);
    for y in 0..h {
        precompute_references(
            image,
            chan,
            w,
            h,
            channel.hshift,
            channel.vshift,
            y,
            &mut references,
        );
        init_props_row(&mut props, static_props, y);
        let mut prev_grad = 0i64;
        for x in 0..w {
            let refs = &references[x * num_extra..(x + 1) * num_extra];
            let res = predict_tree_wp(
                &mut props,
                data,
                w,
                x,
                y,
                flat,
                refs,
                &mut prev_grad,
                &mut wp,
            );
            let sample = data[y * w + x] as i64;
            let residual = sample - res.guess;
            assert!(
                residual % res.multiplier as i64 == 0,
                "leaf multiplier does not divide the residual"
            );
            tokens.push(Token::new(
                res.context,
                pack_signed((residual / res.multiplier as i64) as i32),
            ));
            wp.update_errors(sample, x, y, w);
        }
    }
    Ok(EncoderPath::General)
}

/// Walks one channel, computing the property vector and per-candidate
/// residuals, and pushes a deterministic sample subset into `samples`.
pub(crate) fn gather_tree_data(
    image: &Image,
    chan: usize,
    group_id: u32,
    wp_header: &crate::param::WpHeader,
    predictors: &[Predictor],
    options: &ModularOptions,
    samples: &mut TreeSamples,
    total_pixels: &mut usize,
) {
    let channel = &image.channel[chan];
    let (w, h) = (channel.w, channel.h);
    let data = channel.data();
    tracing::trace!(w, h, chan, "gathering tree data");

    let num_props = NUM_NONREF_PROPERTIES + EXTRA_PROPS_PER_CHANNEL * options.max_properties;
    samples.ensure_shape(num_props, predictors.len());

    let mut pixel_fraction = f64::from(options.nb_repeats).min(1.0);
    // a fraction of 0 disables learning entirely
    if pixel_fraction > 0.0 {
        pixel_fraction = pixel_fraction.max((1024.0 / (w * h) as f64).min(1.0));
    }
    let threshold = ((u64::MAX >> 32) as f64 * pixel_fraction) as u64;
    let mut s: [u64; 2] = [0x94D0_49BB_1331_11EB, 0xBF58_476D_1CE4_E5B9];
    // Xorshift128+
    let mut use_sample = move || {
        let mut s1 = s[0];
        let s0 = s[1];
        let bits = s1.wrapping_add(s0);
        s[0] = s0;
        s1 ^= s1 << 23;
        s1 ^= s0 ^ (s1 >> 18) ^ (s0 >> 5);
        s[1] = s1;
        (bits >> 32) <= threshold
    };

    let expected = (pixel_fraction * (w * h) as f64) as usize;
    for column in samples.residuals.iter_mut() {
        column.reserve(expected);
    }
    for column in samples.props.iter_mut() {
        column.reserve(expected);
    }

    let static_props = [chan as i32, group_id as i32];
    let num_extra = num_props - NUM_NONREF_PROPERTIES;
    let mut references = vec![0i32; num_extra * w];
    let mut props = vec![0i32; num_props];
    let mut wp = weighted::State::new(wp_header, w);
    let mut guesses = [0i64; NUM_MODULAR_PREDICTORS];
    let mut residuals = vec![0i64; predictors.len()];

    for y in 0..h {
        precompute_references(
            image,
            chan,
            w,
            h,
            channel.hshift,
            channel.vshift,
            y,
            &mut references,
        );
        init_props_row(&mut props, static_props, y);
        let mut prev_grad = 0i64;
        for x in 0..w {
            let refs = &references[x * num_extra..(x + 1) * num_extra];
            let sample = data[y * w + x] as i64;
            if predictors.len() != 1 {
                predict_learn_all(
                    &mut props,
                    data,
                    w,
                    x,
                    y,
                    refs,
                    &mut prev_grad,
                    &mut wp,
                    &mut guesses,
                );
                for (residual, &predictor) in residuals.iter_mut().zip(predictors) {
                    *residual = sample - guesses[predictor as usize];
                }
            } else {
                let guess = predict_learn(
                    &mut props,
                    data,
                    w,
                    x,
                    y,
                    predictors[0],
                    refs,
                    &mut prev_grad,
                    &mut wp,
                );
                residuals[0] = sample - guess;
            }
            *total_pixels += 1;
            if use_sample() {
                for (column, &residual) in samples.residuals.iter_mut().zip(&residuals) {
                    column.push(predictor::sat_i32(residual));
                }
                for (column, &prop) in samples.props.iter_mut().zip(&props) {
                    column.push(prop);
                }
            }
            wp.update_errors(sample, x, y, w);
        }
    }
}

/// Encodes `image`, in one of three modes selected by `output`; see
/// [`CompressOutput`].
pub fn modular_generic_compress(
    image: &Image,
    options: &ModularOptions,
    group_id: u32,
    output: CompressOutput<'_>,
) -> Result<()> {
    if image.error {
        return Err(Error::InvalidImage);
    }
    if image.channel.is_empty() {
        return Ok(());
    }

    let nb_channels = image.channel.len();
    tracing::debug!(nb_channels, w = image.w, h = image.h, "modular encode");

    let predictors = candidate_predictors(options);
    let mut header = GroupHeader::default();
    if options.predictor == PredictorChoice::Fixed(Predictor::Weighted) {
        predictor_mode(options.wp_mode, &mut header.wp_header);
    }
    header.transforms = image.transform.clone();

    let channels = coded_channels(image, options);

    match output {
        CompressOutput::Gather {
            samples,
            total_pixels,
        } => {
            for &i in &channels {
                gather_tree_data(
                    image,
                    i,
                    group_id,
                    &header.wp_header,
                    &predictors,
                    options,
                    samples,
                    total_pixels,
                );
            }
            Ok(())
        }
        CompressOutput::Inline { writer } => {
            header.use_global_tree = false;
            header.write(writer)?;

            if options.force_no_wp
                && predictors.len() == 1
                && predictors[0] == Predictor::Weighted
            {
                return Err(Error::LogicError(
                    "cannot force_no_wp with a single Weighted candidate",
                ));
            }

            let mut samples = TreeSamples::new();
            let mut total_pixels = 0usize;
            for &i in &channels {
                gather_tree_data(
                    image,
                    i,
                    group_id,
                    &header.wp_header,
                    &predictors,
                    options,
                    &mut samples,
                    &mut total_pixels,
                );
            }

            let tree = learn_tree(
                predictors,
                samples,
                total_pixels,
                options,
                &[],
                [[0; 2]; 2],
            );
            let (tree_tokens, tree) = tokenize_tree(&tree);
            tracing::debug!(nodes = tree.len(), "encoding MA tree");
            let tree_code = build_and_encode_histograms(NUM_TREE_CONTEXTS, &tree_tokens, writer);
            write_tokens(&tree_tokens, &tree_code, writer);

            let mut tokens = Vec::new();
            for &i in &channels {
                encode_modular_channel(image, i, &header.wp_header, &tree, group_id, &mut tokens)?;
            }
            let code =
                build_and_encode_histograms((tree.len() + 1) / 2, &tokens, writer);
            write_tokens(&tokens, &code, writer);
            Ok(())
        }
        CompressOutput::Tokens {
            tree,
            header: out_header,
            tokens,
            width,
        } => {
            header.use_global_tree = true;
            let mut image_width = 0usize;
            for &i in &channels {
                image_width = image_width.max(image.channel[i].w);
                encode_modular_channel(image, i, &header.wp_header, tree, group_id, tokens)?;
            }
            *width = image_width;
            *out_header = header;
            Ok(())
        }
    }
}
