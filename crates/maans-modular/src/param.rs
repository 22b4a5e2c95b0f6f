use maans_bitstream::{BitWriter, Bitstream, U32Spec};

use crate::predictor::Predictor;
use crate::transform::Transform;
use crate::Result;

/// Tunable parameters of the weighted predictor, carried in the group
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpHeader {
    pub wp_p1: u32,
    pub wp_p2: u32,
    pub wp_p3a: u32,
    pub wp_p3b: u32,
    pub wp_p3c: u32,
    pub wp_p3d: u32,
    pub wp_p3e: u32,
    pub wp_w0: u32,
    pub wp_w1: u32,
    pub wp_w2: u32,
    pub wp_w3: u32,
}

impl Default for WpHeader {
    fn default() -> Self {
        Self {
            wp_p1: 16,
            wp_p2: 10,
            wp_p3a: 7,
            wp_p3b: 7,
            wp_p3c: 7,
            wp_p3d: 0,
            wp_p3e: 0,
            wp_w0: 13,
            wp_w1: 12,
            wp_w2: 12,
            wp_w3: 12,
        }
    }
}

impl WpHeader {
    pub(crate) fn parse(bitstream: &mut Bitstream) -> Result<Self> {
        let default_wp = bitstream.read_bool()?;
        if default_wp {
            return Ok(Self::default());
        }
        Ok(Self {
            wp_p1: bitstream.read_bits(5)?,
            wp_p2: bitstream.read_bits(5)?,
            wp_p3a: bitstream.read_bits(5)?,
            wp_p3b: bitstream.read_bits(5)?,
            wp_p3c: bitstream.read_bits(5)?,
            wp_p3d: bitstream.read_bits(5)?,
            wp_p3e: bitstream.read_bits(5)?,
            wp_w0: bitstream.read_bits(4)?,
            wp_w1: bitstream.read_bits(4)?,
            wp_w2: bitstream.read_bits(4)?,
            wp_w3: bitstream.read_bits(4)?,
        })
    }

    pub(crate) fn write(&self, writer: &mut BitWriter) {
        let default_wp = *self == Self::default();
        writer.write_bool(default_wp);
        if default_wp {
            return;
        }
        writer.write_bits(self.wp_p1, 5);
        writer.write_bits(self.wp_p2, 5);
        writer.write_bits(self.wp_p3a, 5);
        writer.write_bits(self.wp_p3b, 5);
        writer.write_bits(self.wp_p3c, 5);
        writer.write_bits(self.wp_p3d, 5);
        writer.write_bits(self.wp_p3e, 5);
        writer.write_bits(self.wp_w0, 4);
        writer.write_bits(self.wp_w1, 4);
        writer.write_bits(self.wp_w2, 4);
        writer.write_bits(self.wp_w3, 4);
    }
}

/// Fills `header` with the weighted predictor preset selected by `wp_mode`.
pub fn predictor_mode(wp_mode: u32, header: &mut WpHeader) {
    *header = WpHeader::default();
    match wp_mode {
        1 => {
            header.wp_p1 = 20;
            header.wp_p2 = 16;
        }
        2 => {
            header.wp_p1 = 12;
            header.wp_p2 = 8;
            header.wp_p3a = 9;
            header.wp_p3b = 9;
            header.wp_p3c = 9;
        }
        3 => {
            header.wp_w0 = 15;
            header.wp_w1 = 13;
        }
        4 => {
            header.wp_p3d = 16;
            header.wp_p3e = 8;
        }
        _ => {}
    }
}

const NB_TRANSFORMS_SPEC: [U32Spec; 4] = [
    U32Spec::new(0, 0),
    U32Spec::new(1, 0),
    U32Spec::new(2, 4),
    U32Spec::new(18, 8),
];

/// Per-group header: the weighted predictor parameters, the recorded
/// transform list, and whether the tree is supplied out of band.
#[derive(Debug, Clone, Default)]
pub struct GroupHeader {
    pub use_global_tree: bool,
    pub wp_header: WpHeader,
    pub transforms: Vec<Transform>,
}

impl GroupHeader {
    pub fn parse(bitstream: &mut Bitstream) -> Result<Self> {
        let use_global_tree = bitstream.read_bool()?;
        let wp_header = WpHeader::parse(bitstream)?;
        let nb_transforms = bitstream.read_u32(NB_TRANSFORMS_SPEC)?;
        if nb_transforms > 512 {
            tracing::error!(nb_transforms, "nb_transforms too large");
            return Err(crate::Error::InvalidImage);
        }
        let transforms = (0..nb_transforms)
            .map(|_| Transform::parse(bitstream))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            use_global_tree,
            wp_header,
            transforms,
        })
    }

    pub fn write(&self, writer: &mut BitWriter) -> Result<()> {
        writer.write_bool(self.use_global_tree);
        self.wp_header.write(writer);
        writer.write_u32(NB_TRANSFORMS_SPEC, self.transforms.len() as u32)?;
        for transform in &self.transforms {
            transform.write(writer)?;
        }
        Ok(())
    }
}

/// Which predictors the encoder trains over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorChoice {
    /// Use exactly this predictor.
    Fixed(Predictor),
    /// Train over every predictor.
    Variable,
    /// Train over `{Gradient, Weighted}`.
    Best,
}

/// Encoder/decoder options. Only the channel iteration keys
/// (`skipchannels`, `max_chan_size`) and `identify` affect decoding.
#[derive(Debug, Clone)]
pub struct ModularOptions {
    pub predictor: PredictorChoice,
    pub wp_mode: u32,
    /// Fraction of pixels sampled for tree learning; 0 disables learning.
    pub nb_repeats: f32,
    /// Number of previous channels considered for reference properties.
    pub max_properties: usize,
    /// Channels larger than this belong to a coarser stream and are not
    /// coded here.
    pub max_chan_size: usize,
    pub skipchannels: usize,
    pub splitting_heuristics_max_properties: usize,
    pub splitting_heuristics_node_threshold: f32,
    /// Scales the estimated cost of slow-to-decode leaves; values above 1
    /// bias the learner towards faster predictors.
    pub fast_decode_multiplier: f32,
    pub force_wp_only: bool,
    pub force_no_wp: bool,
    /// Stop decoding right after the header and transform metadata.
    pub identify: bool,
}

impl Default for ModularOptions {
    fn default() -> Self {
        Self {
            predictor: PredictorChoice::Fixed(Predictor::Gradient),
            wp_mode: 0,
            nb_repeats: 0.5,
            max_properties: 0,
            max_chan_size: 0xff_ffff,
            skipchannels: 0,
            splitting_heuristics_max_properties: 8,
            splitting_heuristics_node_threshold: 96.0,
            fast_decode_multiplier: 1.0,
            force_wp_only: false,
            force_no_wp: false,
            identify: false,
        }
    }
}
