//! Decoder: per-channel sample reconstruction with its fast tracks, and the
//! top-level decompress entry point.

use maans_bitstream::{saturating_add_px, unpack_signed, Bitstream};
use maans_coding::Decoder;

use crate::encode::coded_channels;
use crate::image::Image;
use crate::ma::{build_wp_only_tables, decode_tree, filter_tree, Tree};
use crate::param::{GroupHeader, ModularOptions, WpHeader};
use crate::predictor::{
    self, init_props_row, precompute_references, predict_no_tree_no_wp, predict_no_tree_wp,
    predict_tree_no_wp, predict_tree_wp, weighted, Predictor,
};
use crate::{Error, Result, NUM_NONREF_PROPERTIES, NUM_TREE_CONTEXTS, WP_PROP_RANGE};

/// Which track the channel decoder took. Exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPath {
    WpOnly,
    ConstantFill,
    SingleZero,
    SingleNoWp,
    SingleWp,
    TreeNoWp,
    TreeWp,
}

/// A global MA tree with its entropy code, shared by the groups that set
/// `use_global_tree`.
#[derive(Debug, Clone)]
pub struct MaConfig {
    pub tree: Tree,
    pub decoder: Decoder,
}

impl MaConfig {
    /// Reads a global tree section: the tree's own entropy code and tokens,
    /// then the sample distributions keyed by the tree's leaves.
    pub fn parse(bitstream: &mut Bitstream, node_limit: usize) -> Result<Self> {
        let mut tree_decoder = Decoder::parse(bitstream, NUM_TREE_CONTEXTS as u32)?;
        tree_decoder.begin(bitstream)?;
        let tree = decode_tree(bitstream, &mut tree_decoder, node_limit)?;
        tree_decoder.finalize()?;
        let decoder = Decoder::parse(bitstream, ((tree.len() + 1) / 2) as u32)?;
        Ok(Self { tree, decoder })
    }
}

/// Decodes one channel in place.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_modular_channel(
    bitstream: &mut Bitstream,
    reader: &mut Decoder,
    context_map: &[u8],
    global_tree: &Tree,
    wp_header: &WpHeader,
    chan: usize,
    group_id: u32,
    image: &mut Image,
) -> Result<DecoderPath> {
    let channel = &image.channel[chan];
    let (w, h) = (channel.w, channel.h);
    let (hshift, vshift) = (channel.hshift, channel.vshift);
    debug_assert!(w != 0 && h != 0);

    let static_props = [chan as i32, group_id as i32];
    let filtered = filter_tree(global_tree, static_props);
    let mut flat = filtered.nodes;
    // From here on, tree lookup returns a *clustered* context id. This
    // avoids a map lookup per pixel.
    for node in &mut flat {
        if node.property0 == -1 {
            flat_leaf_cluster(node, context_map)?;
        }
    }
    tracing::debug!(nodes = flat.len(), "decoding using a filtered MA tree");

    let mut data = std::mem::take(&mut image.channel[chan].data);
    if data.len() != w * h {
        data.resize(w * h, 0);
    }

    let result = (|| -> Result<DecoderPath> {
        if filtered.wp_only {
            if let Some(tables) = build_wp_only_tables(&flat, false) {
                tracing::trace!("wp fast track");
                let mut wp = weighted::State::new(wp_header, w);
                for y in 0..h {
                    for x in 0..w {
                        let neigh = predictor::neighborhood(&data, w, x, y);
                        let (guess, property) =
                            wp.predict(neigh.n, neigh.w, neigh.ne, neigh.nw, neigh.nn);
                        let pos = (property.clamp(-WP_PROP_RANGE, WP_PROP_RANGE - 1)
                            + WP_PROP_RANGE) as usize;
                        let ctx = tables.context_lookup[pos] as u8;
                        let v = reader.read_varint_clustered(bitstream, ctx)?;
                        let value = saturating_add_px(
                            unpack_signed(v) as i64 * tables.multipliers[pos] as i64
                                + tables.offsets[pos] as i64,
                            guess,
                        );
                        data[y * w + x] = value;
                        wp.update_errors(value as i64, x, y, w);
                    }
                }
                return Ok(DecoderPath::WpOnly);
            }
        }

        if flat.len() == 1 {
            // no meta-adaptation, so no need to compute properties
            let node = flat[0];
            let predictor = node.predictor;
            let offset = node.predictor_offset;
            let multiplier = node.multiplier as i64;
            let ctx = node.child_id as u8;
            if predictor == Predictor::Zero {
                if let Some(value) = reader.single_token(ctx) {
                    // single symbol with no extra bits: the channel is
                    // constant and the token stream consumes nothing
                    tracing::trace!("fastest track");
                    let value =
                        saturating_add_px(unpack_signed(value) as i64 * multiplier, offset);
                    data.fill(value);
                    return Ok(DecoderPath::ConstantFill);
                }
                tracing::trace!("fast track");
                for value in data.iter_mut() {
                    let v = reader.read_varint_clustered(bitstream, ctx)?;
                    *value = saturating_add_px(unpack_signed(v) as i64 * multiplier, offset);
                }
                return Ok(DecoderPath::SingleZero);
            }
            if predictor != Predictor::Weighted {
                tracing::trace!("quite fast track");
                for y in 0..h {
                    for x in 0..w {
                        let guess = predict_no_tree_no_wp(&data, w, x, y, predictor) + offset;
                        let v = reader.read_varint_clustered(bitstream, ctx)?;
                        data[y * w + x] =
                            saturating_add_px(unpack_signed(v) as i64 * multiplier, guess);
                    }
                }
                return Ok(DecoderPath::SingleNoWp);
            }
            tracing::trace!("somewhat fast track");
            let mut wp = weighted::State::new(wp_header, w);
            for y in 0..h {
                for x in 0..w {
                    let guess = predict_no_tree_wp(&data, w, x, y, predictor, &mut wp) + offset;
                    let v = reader.read_varint_clustered(bitstream, ctx)?;
                    let value = saturating_add_px(unpack_signed(v) as i64 * multiplier, guess);
                    data[y * w + x] = value;
                    wp.update_errors(value as i64, x, y, w);
                }
            }
            return Ok(DecoderPath::SingleWp);
        }

        let num_extra = filtered.num_props - NUM_NONREF_PROPERTIES;
        let mut references = vec![0i32; num_extra * w];
        let mut props = vec![0i32; filtered.num_props];

        if !filtered.use_wp {
            // the weighted predictor and its property are unused; skip all
            // of its state tracking
            tracing::trace!("slow track");
            for y in 0..h {
                precompute_references(image, chan, w, h, hshift, vshift, y, &mut references);
                init_props_row(&mut props, static_props, y);
                let mut prev_grad = 0i64;
                for x in 0..w {
                    let refs = &references[x * num_extra..(x + 1) * num_extra];
                    let res = predict_tree_no_wp(
                        &mut props,
                        &data,
                        w,
                        x,
                        y,
                        &flat,
                        refs,
                        &mut prev_grad,
                    );
                    let v = reader.read_varint_clustered(bitstream, res.context as u8)?;
                    data[y * w + x] = saturating_add_px(
                        unpack_signed(v) as i64 * res.multiplier as i64,
                        res.guess,
                    );
                }
            }
            return Ok(DecoderPath::TreeNoWp);
        }

        tracing::trace!("slowest track");
        let mut wp = weighted::State::new(wp_header, w);
        for y in 0..h {
            precompute_references(image, chan, w, h, hshift, vshift, y, &mut references);
            init_props_row(&mut props, static_props, y);
            let mut prev_grad = 0i64;
            for x in 0..w {
                let refs = &references[x * num_extra..(x + 1) * num_extra];
                let res = predict_tree_wp(
                    &mut props,
                    &data,
                    w,
                    x,
                    y,
                    &flat,
                    refs,
                    &mut prev_grad,
                    &mut wp,
                );
                let v = reader.read_varint_clustered(bitstream, res.context as u8)?;
                let value = saturating_add_px(
                    unpack_signed(v) as i64 * res.multiplier as i64,
                    res.guess,
                );
                data[y * w + x] = value;
                wp.update_errors(value as i64, x, y, w);
            }
        }
        Ok(DecoderPath::TreeWp)
    })();

    image.channel[chan].data = data;
    result
}

fn flat_leaf_cluster(
    node: &mut crate::ma::FlatDecisionNode,
    context_map: &[u8],
) -> Result<()> {
    let cluster = context_map
        .get(node.child_id as usize)
        .ok_or(Error::InvalidMaTree)?;
    node.child_id = *cluster as u32;
    Ok(())
}

/// Reads a group: header, transform metadata, local tree (unless a global
/// one is supplied), and every selected channel.
pub(crate) fn modular_decode(
    bitstream: &mut Bitstream,
    image: &mut Image,
    group_id: u32,
    options: &ModularOptions,
    global: Option<&MaConfig>,
) -> Result<()> {
    if image.channel.is_empty() {
        return Ok(());
    }

    let header = GroupHeader::parse(bitstream)?;
    tracing::debug!(
        nb_transforms = header.transforms.len(),
        use_global_tree = header.use_global_tree,
        "modular group header"
    );
    for transform in &header.transforms {
        transform.meta_apply(image)?;
    }
    image.transform = header.transforms.clone();
    if options.identify {
        return Ok(());
    }
    if image.error {
        return Err(Error::InvalidImage);
    }

    let channels = coded_channels(image, options);
    if channels.is_empty() {
        return Ok(());
    }

    let (tree, mut reader) = if !header.use_global_tree {
        let local_samples: usize = channels
            .iter()
            .map(|&i| image.channel[i].w * image.channel[i].h)
            .sum();
        let node_limit = (1024 + local_samples).min(1 << 20);
        let mut tree_decoder = Decoder::parse(bitstream, NUM_TREE_CONTEXTS as u32)?;
        tree_decoder.begin(bitstream)?;
        let tree = decode_tree(bitstream, &mut tree_decoder, node_limit)?;
        tree_decoder.finalize()?;
        let reader = Decoder::parse(bitstream, ((tree.len() + 1) / 2) as u32)?;
        (tree, reader)
    } else {
        let Some(global) = global else {
            tracing::error!("no global tree available but one was requested");
            return Err(Error::GlobalMaTreeNotAvailable);
        };
        if global.tree.is_empty() {
            return Err(Error::GlobalMaTreeNotAvailable);
        }
        (global.tree.clone(), global.decoder.clone())
    };

    let context_map = reader.cluster_map().to_vec();
    reader.begin(bitstream)?;
    for &i in &channels {
        decode_modular_channel(
            bitstream,
            &mut reader,
            &context_map,
            &tree,
            &header.wp_header,
            i,
            group_id,
            image,
        )?;
    }
    reader.finalize()?;
    Ok(())
}

/// Decodes a group and inverts the last `undo_transforms` recorded
/// transforms (`-1` inverts all).
pub fn modular_generic_decompress(
    bitstream: &mut Bitstream,
    image: &mut Image,
    group_id: u32,
    options: &ModularOptions,
    undo_transforms: i32,
    global: Option<&MaConfig>,
) -> Result<()> {
    let bits = bitstream.num_read_bits();
    modular_decode(bitstream, image, group_id, options, global)?;
    if options.identify {
        return Ok(());
    }
    image.undo_transforms(undo_transforms)?;
    tracing::debug!(
        w = image.w,
        h = image.h,
        nb_channels = image.channel.len(),
        bytes = (bitstream.num_read_bits() - bits) / 8,
        "modular-decoded image"
    );
    Ok(())
}
