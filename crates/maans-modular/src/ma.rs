//! Meta-adaptive tree: logical and flattened representations, static
//! property specialization, and tree (de)serialization.

use std::collections::VecDeque;

use maans_bitstream::{pack_signed, unpack_signed, Bitstream};
use maans_coding::{Decoder, Token};

use crate::predictor::Predictor;
use crate::{
    Error, Result, EXTRA_PROPS_PER_CHANNEL, NUM_NONREF_PROPERTIES, NUM_STATIC_PROPERTIES, WP_PROP,
    WP_PROP_RANGE,
};

/// A node of the logical tree. `property == -1` marks a leaf; a leaf stores
/// its context id in `lchild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    pub property: i32,
    pub splitval: i32,
    pub lchild: u32,
    pub rchild: u32,
    pub predictor: Predictor,
    pub predictor_offset: i64,
    pub multiplier: u32,
}

pub type Tree = Vec<TreeNode>;

impl TreeNode {
    pub fn decision(property: i32, splitval: i32, lchild: u32, rchild: u32) -> Self {
        debug_assert!(property >= 0);
        Self {
            property,
            splitval,
            lchild,
            rchild,
            predictor: Predictor::Zero,
            predictor_offset: 0,
            multiplier: 1,
        }
    }

    pub fn leaf(context: u32, predictor: Predictor, predictor_offset: i64, multiplier: u32) -> Self {
        debug_assert!(multiplier >= 1);
        Self {
            property: -1,
            splitval: 0,
            lchild: context,
            rchild: context,
            predictor,
            predictor_offset,
            multiplier,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.property < 0
    }
}

/// A two-level node of the flattened tree. `property0 == -1` marks a leaf,
/// whose `child_id` is the context id; otherwise `child_id` points at four
/// contiguous grandchild slots in the order `(>,>)`, `(>,<=)`, `(<=,>)`,
/// `(<=,<=)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatDecisionNode {
    pub property0: i32,
    pub splitval0: i32,
    pub child_id: u32,
    pub properties: [i32; 2],
    pub splitvals: [i32; 2],
    pub predictor: Predictor,
    pub predictor_offset: i64,
    pub multiplier: u32,
}

pub type FlatTree = Vec<FlatDecisionNode>;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FilteredTree {
    pub nodes: FlatTree,
    pub num_props: usize,
    pub use_wp: bool,
    pub wp_only: bool,
}

/// Removes all decisions on static properties (resolving them against
/// `static_props`) and collapses the remaining tree two levels at a time.
///
/// When an inner parent has a leaf as child, a dummy decision is recorded
/// and the leaf is enqueued twice, so every non-leaf always has four
/// grandchild slots. Also computes whether the result needs the weighted
/// predictor, whether it is driven by the WP property alone, and how many
/// properties it reads.
pub(crate) fn filter_tree(global_tree: &[TreeNode], static_props: [i32; 2]) -> FilteredTree {
    let mut use_wp = false;
    let mut wp_only = true;
    let mut num_props = 0usize;
    let mut used_properties = 0u64;
    let mut output: FlatTree = Vec::new();
    let mut nodes: VecDeque<usize> = VecDeque::new();
    nodes.push_back(0);

    let resolve_static = |mut cur: usize| {
        while !global_tree[cur].is_leaf()
            && (global_tree[cur].property as usize) < NUM_STATIC_PROPERTIES
        {
            let node = &global_tree[cur];
            cur = if static_props[node.property as usize] > node.splitval {
                node.lchild as usize
            } else {
                node.rchild as usize
            };
        }
        cur
    };

    while let Some(cur) = nodes.pop_front() {
        let cur = resolve_static(cur);
        let node = &global_tree[cur];
        if node.is_leaf() {
            if node.predictor == Predictor::Weighted {
                use_wp = true;
            } else {
                wp_only = false;
            }
            output.push(FlatDecisionNode {
                property0: -1,
                splitval0: 0,
                child_id: node.lchild,
                properties: [0; 2],
                splitvals: [0; 2],
                predictor: node.predictor,
                predictor_offset: node.predictor_offset,
                multiplier: node.multiplier,
            });
            continue;
        }

        let mut flat = FlatDecisionNode {
            property0: node.property,
            splitval0: node.splitval,
            child_id: (output.len() + nodes.len() + 1) as u32,
            properties: [0; 2],
            splitvals: [0; 2],
            predictor: Predictor::Zero,
            predictor_offset: 0,
            multiplier: 1,
        };
        num_props = num_props.max(node.property as usize + 1);

        for i in 0..2 {
            let child = if i == 0 { node.lchild } else { node.rchild };
            let child = resolve_static(child as usize);
            let child_node = &global_tree[child];
            if child_node.is_leaf() {
                // dummy decision, two copies of the leaf
                flat.properties[i] = 0;
                flat.splitvals[i] = 0;
                nodes.push_back(child);
                nodes.push_back(child);
            } else {
                flat.properties[i] = child_node.property;
                flat.splitvals[i] = child_node.splitval;
                nodes.push_back(child_node.lchild as usize);
                nodes.push_back(child_node.rchild as usize);
                num_props = num_props.max(child_node.property as usize + 1);
            }
        }

        for property in [flat.properties[0], flat.properties[1], flat.property0] {
            let property = property as usize;
            if property >= NUM_STATIC_PROPERTIES {
                if property < u64::BITS as usize {
                    used_properties |= 1 << property;
                } else {
                    wp_only = false;
                }
            }
        }
        output.push(flat);
    }

    if num_props > NUM_NONREF_PROPERTIES {
        num_props = (num_props - NUM_NONREF_PROPERTIES).div_ceil(EXTRA_PROPS_PER_CHANNEL)
            * EXTRA_PROPS_PER_CHANNEL
            + NUM_NONREF_PROPERTIES;
    } else {
        num_props = NUM_NONREF_PROPERTIES;
    }
    if used_properties & (1 << WP_PROP) != 0 {
        use_wp = true;
    }
    if used_properties != (1 << WP_PROP) {
        wp_only = false;
    }

    FilteredTree {
        nodes: output,
        num_props,
        use_wp,
        wp_only,
    }
}

/// Walks the flat tree, two decisions per step, and returns the selected
/// leaf.
#[inline]
pub(crate) fn tree_lookup<'a>(nodes: &'a [FlatDecisionNode], props: &[i32]) -> &'a FlatDecisionNode {
    let mut pos = 0usize;
    loop {
        let node = &nodes[pos];
        if node.property0 < 0 {
            return node;
        }
        pos = if props[node.property0 as usize] > node.splitval0 {
            let right = props[node.properties[0] as usize] > node.splitvals[0];
            node.child_id as usize + if right { 0 } else { 1 }
        } else {
            let right = props[node.properties[1] as usize] > node.splitvals[1];
            node.child_id as usize + if right { 2 } else { 3 }
        };
    }
}

/// Lookup tables for the WP-only fast path: for every clamped WP property
/// value, the leaf's context id and reconstruction parameters.
pub(crate) struct WpOnlyTables {
    pub context_lookup: Box<[u16; 2 * WP_PROP_RANGE as usize]>,
    pub multipliers: Box<[i32; 2 * WP_PROP_RANGE as usize]>,
    pub offsets: Box<[i8; 2 * WP_PROP_RANGE as usize]>,
}

/// Builds the WP-only lookup tables by sweeping property ranges down the
/// flat tree. Returns `None` (fall back to the general path) when the tree
/// reaches outside the property range or a leaf is not representable;
/// `require_identity_leaves` additionally rejects any leaf with a non-unit
/// multiplier or non-zero offset, as the encoder-side table carries neither.
pub(crate) fn build_wp_only_tables(
    tree: &[FlatDecisionNode],
    require_identity_leaves: bool,
) -> Option<WpOnlyTables> {
    const TABLE_SIZE: usize = 2 * WP_PROP_RANGE as usize;
    struct TreeRange {
        // Begin *excluded*, end *included*. This works best with > vs <=
        // decision nodes.
        begin: i32,
        end: i32,
        pos: usize,
    }

    let mut context_lookup = Box::new([0u16; TABLE_SIZE]);
    let mut multipliers = Box::new([0i32; TABLE_SIZE]);
    let mut offsets = Box::new([0i8; TABLE_SIZE]);

    let mut ranges = vec![TreeRange {
        begin: -WP_PROP_RANGE - 1,
        end: WP_PROP_RANGE - 1,
        pos: 0,
    }];
    while let Some(cur) = ranges.pop() {
        if cur.begin < -WP_PROP_RANGE - 1
            || cur.begin >= WP_PROP_RANGE - 1
            || cur.end > WP_PROP_RANGE - 1
        {
            // tree reaches outside the allowed range
            return None;
        }
        let node = &tree[cur.pos];
        if node.property0 == -1 {
            if node.predictor_offset < i8::MIN as i64 || node.predictor_offset > i8::MAX as i64 {
                return None;
            }
            if require_identity_leaves && (node.multiplier != 1 || node.predictor_offset != 0) {
                return None;
            }
            for i in (cur.begin + 1)..(cur.end + 1) {
                let idx = (i + WP_PROP_RANGE) as usize;
                context_lookup[idx] = node.child_id as u16;
                multipliers[idx] = node.multiplier as i32;
                offsets[idx] = node.predictor_offset as i8;
            }
            continue;
        }
        // > side of the top node
        if node.properties[0] as usize >= NUM_STATIC_PROPERTIES {
            ranges.push(TreeRange {
                begin: node.splitvals[0],
                end: cur.end,
                pos: node.child_id as usize,
            });
            ranges.push(TreeRange {
                begin: node.splitval0,
                end: node.splitvals[0],
                pos: node.child_id as usize + 1,
            });
        } else {
            ranges.push(TreeRange {
                begin: node.splitval0,
                end: cur.end,
                pos: node.child_id as usize,
            });
        }
        // <= side
        if node.properties[1] as usize >= NUM_STATIC_PROPERTIES {
            ranges.push(TreeRange {
                begin: node.splitvals[1],
                end: node.splitval0,
                pos: node.child_id as usize + 2,
            });
            ranges.push(TreeRange {
                begin: cur.begin,
                end: node.splitvals[1],
                pos: node.child_id as usize + 3,
            });
        } else {
            ranges.push(TreeRange {
                begin: cur.begin,
                end: node.splitval0,
                pos: node.child_id as usize + 2,
            });
        }
    }

    Some(WpOnlyTables {
        context_lookup,
        multipliers,
        offsets,
    })
}

/// Serializes the tree as entropy tokens over [`NUM_TREE_CONTEXTS`] token
/// contexts, in BFS order.
///
/// Also returns the decoder's view of the tree: BFS-renumbered children and
/// leaf context ids assigned in BFS order. The caller must use that view for
/// encoding so both sides agree on context numbering.
///
/// [`NUM_TREE_CONTEXTS`]: crate::NUM_TREE_CONTEXTS
pub fn tokenize_tree(tree: &[TreeNode]) -> (Vec<Token>, Tree) {
    let mut order = Vec::with_capacity(tree.len());
    let mut queue = VecDeque::from([0usize]);
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        let node = &tree[idx];
        if !node.is_leaf() {
            queue.push_back(node.lchild as usize);
            queue.push_back(node.rchild as usize);
        }
    }
    assert_eq!(order.len(), tree.len(), "tree has unreachable nodes");

    let mut bfs_pos = vec![0u32; tree.len()];
    for (pos, &idx) in order.iter().enumerate() {
        bfs_pos[idx] = pos as u32;
    }

    let mut tokens = Vec::with_capacity(tree.len() * 3);
    let mut out = Tree::with_capacity(tree.len());
    let mut ctx = 0u32;
    for &idx in &order {
        let node = &tree[idx];
        if node.is_leaf() {
            let offset = i32::try_from(node.predictor_offset)
                .expect("leaf offset out of serializable range");
            assert!(node.multiplier >= 1);
            let mul_log = node.multiplier.trailing_zeros();
            let mul_bits = (node.multiplier >> mul_log) - 1;
            tokens.push(Token::new(1, 0));
            tokens.push(Token::new(2, node.predictor as u32));
            tokens.push(Token::new(3, pack_signed(offset)));
            tokens.push(Token::new(4, mul_log));
            tokens.push(Token::new(5, mul_bits));
            out.push(TreeNode::leaf(
                ctx,
                node.predictor,
                node.predictor_offset,
                node.multiplier,
            ));
            ctx += 1;
        } else {
            tokens.push(Token::new(1, node.property as u32 + 1));
            tokens.push(Token::new(0, pack_signed(node.splitval)));
            out.push(TreeNode::decision(
                node.property,
                node.splitval,
                bfs_pos[node.lchild as usize],
                bfs_pos[node.rchild as usize],
            ));
        }
    }
    (tokens, out)
}

const MAX_PROPERTY: u32 = 1024;

/// Reads a tree serialized by [`tokenize_tree`], assigning leaf context ids
/// in stream order.
pub fn decode_tree(
    bitstream: &mut Bitstream,
    decoder: &mut Decoder,
    node_limit: usize,
) -> Result<Tree> {
    let mut tree: Tree = Vec::new();
    let mut parents: VecDeque<usize> = VecDeque::new();
    let mut ctx = 0u32;
    let mut nodes_left = 1usize;

    while nodes_left > 0 {
        if tree.len() >= node_limit {
            tracing::error!(node_limit, "decoded MA tree too large");
            return Err(Error::InvalidMaTree);
        }
        nodes_left -= 1;

        let property = decoder.read_varint(bitstream, 1)?;
        let node = if let Some(property) = property.checked_sub(1) {
            if property >= MAX_PROPERTY {
                return Err(Error::InvalidMaTree);
            }
            let splitval = unpack_signed(decoder.read_varint(bitstream, 0)?);
            nodes_left += 2;
            TreeNode::decision(property as i32, splitval, 0, 0)
        } else {
            let predictor = Predictor::try_from(decoder.read_varint(bitstream, 2)?)?;
            let offset = unpack_signed(decoder.read_varint(bitstream, 3)?);
            let mul_log = decoder.read_varint(bitstream, 4)?;
            if mul_log > 30 {
                return Err(Error::InvalidMaTree);
            }
            let mul_bits = decoder.read_varint(bitstream, 5)?;
            if mul_bits > (1 << (31 - mul_log)) - 2 {
                return Err(Error::InvalidMaTree);
            }
            let multiplier = (mul_bits + 1) << mul_log;
            let node = TreeNode::leaf(ctx, predictor, offset as i64, multiplier);
            ctx += 1;
            node
        };

        let idx = tree.len();
        if idx > 0 {
            let &parent = parents.front().unwrap();
            if tree[parent].lchild == 0 {
                tree[parent].lchild = idx as u32;
            } else {
                tree[parent].rchild = idx as u32;
                parents.pop_front();
            }
        }
        let is_decision = !node.is_leaf();
        tree.push(node);
        if is_decision {
            parents.push_back(idx);
        }
    }

    tracing::debug!(nodes = tree.len(), "decoded MA tree");
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maans_bitstream::BitWriter;
    use maans_coding::{build_and_encode_histograms, write_tokens};

    fn wp_leaf(ctx: u32) -> TreeNode {
        TreeNode::leaf(ctx, Predictor::Weighted, 0, 1)
    }

    // property 0 (channel) at the root, then a gradient split
    fn static_then_dynamic_tree() -> Tree {
        vec![
            TreeNode::decision(0, 0, 1, 2),
            TreeNode::leaf(0, Predictor::Gradient, 0, 1),
            TreeNode::decision(9, 5, 3, 4),
            TreeNode::leaf(1, Predictor::Left, 0, 1),
            TreeNode::leaf(2, Predictor::Top, 0, 1),
        ]
    }

    #[test]
    fn flatten_is_deterministic() {
        let tree = static_then_dynamic_tree();
        let first = filter_tree(&tree, [1, 0]);
        let second = filter_tree(&tree, [1, 0]);
        assert_eq!(first, second);
    }

    #[test]
    fn static_properties_are_specialized_away() {
        let tree = static_then_dynamic_tree();

        // channel 1 > 0: the single gradient leaf remains
        let flat = filter_tree(&tree, [1, 0]);
        assert_eq!(flat.nodes.len(), 1);
        assert_eq!(flat.nodes[0].property0, -1);
        assert_eq!(flat.nodes[0].predictor, Predictor::Gradient);
        assert_eq!(flat.nodes[0].child_id, 0);
        assert!(!flat.use_wp);
        assert!(!flat.wp_only);
        assert_eq!(flat.num_props, NUM_NONREF_PROPERTIES);

        // channel 0: the gradient decision survives
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.nodes.len() > 1);
        assert_eq!(flat.nodes[0].property0, 9);
    }

    #[test]
    fn num_props_rounds_up_reference_blocks() {
        let tree = vec![
            TreeNode::decision(NUM_NONREF_PROPERTIES as i32 + 1, 0, 1, 2),
            TreeNode::leaf(0, Predictor::Zero, 0, 1),
            TreeNode::leaf(1, Predictor::Zero, 0, 1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert_eq!(
            flat.num_props,
            NUM_NONREF_PROPERTIES + EXTRA_PROPS_PER_CHANNEL
        );
    }

    #[test]
    fn wp_only_detection() {
        let tree = vec![
            TreeNode::decision(WP_PROP as i32, 0, 1, 2),
            wp_leaf(0),
            wp_leaf(1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.use_wp);
        assert!(flat.wp_only);

        // a non-WP decision property breaks wp_only
        let tree = vec![
            TreeNode::decision(9, 0, 1, 2),
            wp_leaf(0),
            wp_leaf(1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.use_wp);
        assert!(!flat.wp_only);

        // a non-WP leaf predictor breaks wp_only
        let tree = vec![
            TreeNode::decision(WP_PROP as i32, 0, 1, 2),
            wp_leaf(0),
            TreeNode::leaf(1, Predictor::Gradient, 0, 1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(!flat.wp_only);
    }

    #[test]
    fn wp_only_table_matches_tree_walk() {
        let tree = vec![
            TreeNode::decision(WP_PROP as i32, -3, 1, 2),
            TreeNode::decision(WP_PROP as i32, 77, 3, 4),
            TreeNode::decision(WP_PROP as i32, -200, 5, 6),
            wp_leaf(0),
            wp_leaf(1),
            wp_leaf(2),
            wp_leaf(3),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(flat.wp_only);
        let tables = build_wp_only_tables(&flat.nodes, true).unwrap();

        let mut props = vec![0i32; flat.num_props];
        for p in -WP_PROP_RANGE..WP_PROP_RANGE {
            props[WP_PROP] = p;
            let leaf = tree_lookup(&flat.nodes, &props);
            let idx = (p + WP_PROP_RANGE) as usize;
            assert_eq!(tables.context_lookup[idx], leaf.child_id as u16, "p = {}", p);
            assert_eq!(tables.multipliers[idx], leaf.multiplier as i32);
            assert_eq!(tables.offsets[idx] as i64, leaf.predictor_offset);
        }
    }

    #[test]
    fn wp_only_table_rejects_out_of_range_splits() {
        let tree = vec![
            TreeNode::decision(WP_PROP as i32, 600, 1, 2),
            wp_leaf(0),
            wp_leaf(1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(build_wp_only_tables(&flat.nodes, true).is_none());
    }

    #[test]
    fn wp_only_table_rejects_nontrivial_leaves_on_encode_side() {
        let tree = vec![
            TreeNode::decision(WP_PROP as i32, 0, 1, 2),
            TreeNode::leaf(0, Predictor::Weighted, 3, 1),
            wp_leaf(1),
        ];
        let flat = filter_tree(&tree, [0, 0]);
        assert!(build_wp_only_tables(&flat.nodes, true).is_none());
        // the decode side supports small offsets
        assert!(build_wp_only_tables(&flat.nodes, false).is_some());
    }

    #[test]
    fn tree_serialization_roundtrip() {
        let tree = vec![
            TreeNode::decision(9, 5, 1, 2),
            TreeNode::decision(WP_PROP as i32, -17, 3, 4),
            TreeNode::leaf(0, Predictor::Gradient, -200, 3),
            TreeNode::leaf(0, Predictor::Weighted, 0, 1),
            TreeNode::leaf(0, Predictor::Zero, 12, 1 << 16),
        ];
        let (tokens, bfs_tree) = tokenize_tree(&tree);

        let mut writer = BitWriter::new();
        let code =
            build_and_encode_histograms(crate::NUM_TREE_CONTEXTS, &tokens, &mut writer);
        write_tokens(&tokens, &code, &mut writer);
        let bytes = writer.finalize();

        let mut bitstream = Bitstream::new(&bytes);
        let mut decoder =
            Decoder::parse(&mut bitstream, crate::NUM_TREE_CONTEXTS as u32).unwrap();
        decoder.begin(&mut bitstream).unwrap();
        let decoded = decode_tree(&mut bitstream, &mut decoder, 1 << 20).unwrap();
        decoder.finalize().unwrap();

        assert_eq!(decoded, bfs_tree);
        // leaves got BFS-order contexts
        let contexts: Vec<u32> = decoded
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.lchild)
            .collect();
        assert_eq!(contexts, vec![0, 1, 2]);
    }

    #[test]
    fn decode_tree_rejects_oversized_trees() {
        // a long chain of decisions, larger than the node limit
        let mut tree = Tree::new();
        for i in 0..64 {
            tree.push(TreeNode::decision(9, i, 2 * i as u32 + 1, 2 * i as u32 + 2));
            tree.push(TreeNode::leaf(i as u32, Predictor::Zero, 0, 1));
        }
        tree.push(TreeNode::leaf(64, Predictor::Zero, 0, 1));
        let (tokens, _) = tokenize_tree(&tree);

        let mut writer = BitWriter::new();
        let code =
            build_and_encode_histograms(crate::NUM_TREE_CONTEXTS, &tokens, &mut writer);
        write_tokens(&tokens, &code, &mut writer);
        let bytes = writer.finalize();

        let mut bitstream = Bitstream::new(&bytes);
        let mut decoder =
            Decoder::parse(&mut bitstream, crate::NUM_TREE_CONTEXTS as u32).unwrap();
        decoder.begin(&mut bitstream).unwrap();
        assert!(matches!(
            decode_tree(&mut bitstream, &mut decoder, 16),
            Err(Error::InvalidMaTree)
        ));
    }
}
