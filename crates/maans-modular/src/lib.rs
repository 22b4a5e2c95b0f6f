//! Modular-mode MA-ANS channel coder.
//!
//! Losslessly encodes and decodes per-channel integer sample data using a
//! learned meta-adaptive (MA) decision tree combined with a
//! context-clustered entropy coder. The tree's leaves select an entropy
//! context and a `(predictor, offset, multiplier)` triple; a family of
//! spatial predictors, including a stateful weighted predictor, turns
//! samples into small residuals.
//!
//! Encoding is done with [`modular_generic_compress`], which either writes a
//! self-contained group (learned tree, histograms and tokens inline),
//! gathers training samples for a global tree, or tokenizes against a
//! caller-provided global tree. Decoding is done with
//! [`modular_generic_decompress`], optionally against a global [`MaConfig`].

mod decode;
mod encode;
mod error;
mod image;
mod learn;
mod ma;
mod param;
mod predictor;
mod transform;

pub use decode::{modular_generic_decompress, DecoderPath, MaConfig};
pub use encode::{modular_generic_compress, CompressOutput, EncoderPath};
pub use error::{Error, ErrorKind, Result};
pub use image::{Channel, Image};
pub use learn::{learn_tree, ModularMultiplierInfo, StaticPropRange, TreeSamples};
pub use ma::{decode_tree, tokenize_tree, FlatDecisionNode, FlatTree, Tree, TreeNode};
pub use param::{predictor_mode, GroupHeader, ModularOptions, PredictorChoice, WpHeader};
pub use predictor::{weighted, Predictor};
pub use transform::Transform;

/// Properties whose value is constant for a whole channel: the channel
/// index and the group id. Decisions on them are resolved at tree-flatten
/// time.
pub const NUM_STATIC_PROPERTIES: usize = 2;

/// Properties not derived from reference channels, including the static
/// ones and the weighted predictor property.
pub const NUM_NONREF_PROPERTIES: usize = 16;

/// Properties contributed by each referenced prior channel.
pub const EXTRA_PROPS_PER_CHANNEL: usize = 4;

/// Index of the weighted predictor "max error" property.
pub const WP_PROP: usize = NUM_NONREF_PROPERTIES - weighted::NUM_PROPERTIES;

/// Half-range of the WP property covered by the WP-only fast path's lookup
/// tables.
pub const WP_PROP_RANGE: i32 = 512;

/// Number of predictors that can appear at tree leaves.
pub const NUM_MODULAR_PREDICTORS: usize = 14;

/// Token contexts used by tree serialization.
pub const NUM_TREE_CONTEXTS: usize = 6;
