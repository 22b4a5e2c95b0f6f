//! The transform seam of the group header.
//!
//! The transform pipeline proper (palette, squeeze) belongs to the enclosing
//! layer; this coder only records the transform list in the group header and
//! can invert the reversible color transform, which is metadata-neutral.

use std::num::Wrapping;

use maans_bitstream::{BitWriter, Bitstream, U32Spec};

use crate::image::Image;
use crate::{Error, Result};

const BEGIN_C_SPEC: [U32Spec; 4] = [
    U32Spec::new(0, 3),
    U32Spec::new(8, 6),
    U32Spec::new(72, 10),
    U32Spec::new(1096, 13),
];

/// A recorded transform. `rct_type` is `permutation * 7 + type`, with type 6
/// being the lossless YCoCg-R transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Rct { begin_c: u32, rct_type: u32 },
}

impl Transform {
    pub(crate) fn parse(bitstream: &mut Bitstream) -> Result<Self> {
        let id = bitstream.read_bits(2)?;
        match id {
            0 => {
                let begin_c = bitstream.read_u32(BEGIN_C_SPEC)?;
                let rct_type = bitstream.read_bits(6)?;
                if rct_type >= 42 {
                    return Err(maans_bitstream::Error::InvalidEnum {
                        name: "RctType",
                        value: rct_type,
                    }
                    .into());
                }
                Ok(Self::Rct { begin_c, rct_type })
            }
            1 | 2 => Err(Error::UnsupportedTransform),
            _ => Err(maans_bitstream::Error::InvalidEnum {
                name: "TransformId",
                value: id,
            }
            .into()),
        }
    }

    pub(crate) fn write(&self, writer: &mut BitWriter) -> Result<()> {
        match *self {
            Self::Rct { begin_c, rct_type } => {
                writer.write_bits(0, 2);
                writer.write_u32(BEGIN_C_SPEC, begin_c)?;
                writer.write_bits(rct_type, 6);
            }
        }
        Ok(())
    }

    /// Updates and validates channel metadata. RCT leaves the channel list
    /// untouched; it only checks that three compatible channels exist.
    pub fn meta_apply(&self, image: &mut Image) -> Result<()> {
        match *self {
            Self::Rct { begin_c, rct_type } => {
                let begin_c = begin_c as usize;
                let Some(channels) = image.channel.get(begin_c..begin_c + 3) else {
                    tracing::error!(begin_c, "RCT needs three channels");
                    image.error = true;
                    return Err(Error::InvalidImage);
                };
                let (w, h) = (channels[0].w, channels[0].h);
                if channels.iter().any(|ch| ch.w != w || ch.h != h) {
                    tracing::error!(begin_c, rct_type, "RCT channel dimensions mismatch");
                    image.error = true;
                    return Err(Error::InvalidImage);
                }
                Ok(())
            }
        }
    }

    /// Inverts this transform on decoded samples.
    pub fn inverse(&self, image: &mut Image) -> Result<()> {
        match *self {
            Self::Rct { begin_c, rct_type } => {
                let begin_c = begin_c as usize;
                let permutation = rct_type / 7;
                let ty = rct_type % 7;
                let [a, b, c] = three_channels(image, begin_c)?;
                for ((a, b), c) in a.iter_mut().zip(b.iter_mut()).zip(c.iter_mut()) {
                    let (d, e, f) = inverse_rct_pixel(ty, *a, *b, *c);
                    (*a, *b, *c) = (d, e, f);
                }
                inverse_permute(permutation, [a, b, c]);
                Ok(())
            }
        }
    }
}

fn three_channels(image: &mut Image, begin_c: usize) -> Result<[&mut [i32]; 3]> {
    let channels = image
        .channel
        .get_mut(begin_c..begin_c + 3)
        .ok_or(Error::InvalidImage)?;
    let [a, b, c] = channels else {
        return Err(Error::InvalidImage);
    };
    if a.w != b.w || a.h != b.h || a.w != c.w || a.h != c.h {
        return Err(Error::InvalidImage);
    }
    Ok([a.data_mut(), b.data_mut(), c.data_mut()])
}

fn inverse_rct_pixel(ty: u32, a: i32, b: i32, c: i32) -> (i32, i32, i32) {
    let a = Wrapping(a);
    let b = Wrapping(b);
    let c = Wrapping(c);
    let d;
    let e;
    let f;
    if ty == 6 {
        let tmp = a - (c >> 1);
        e = c + tmp;
        f = tmp - (b >> 1);
        d = f + b;
    } else {
        d = a;
        f = if ty & 1 != 0 { c + a } else { c };
        e = if (ty >> 1) == 1 {
            b + a
        } else if (ty >> 1) == 2 {
            b + ((a + f) >> 1)
        } else {
            b
        };
    }
    (d.0, e.0, f.0)
}

fn inverse_permute(permutation: u32, channels: [&mut [i32]; 3]) {
    let [a, b, c] = channels;
    match permutation {
        1 => {
            a.swap_with_slice(b);
            a.swap_with_slice(c);
        }
        2 => {
            a.swap_with_slice(b);
            b.swap_with_slice(c);
        }
        3 => {
            b.swap_with_slice(c);
        }
        4 => {
            a.swap_with_slice(b);
        }
        5 => {
            a.swap_with_slice(c);
        }
        _ => {}
    }
}
