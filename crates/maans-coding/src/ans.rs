use maans_bitstream::Bitstream;

use crate::{Error, Result};

pub(crate) const ANS_LOG_TAB_SIZE: u32 = 12;
pub(crate) const ANS_TAB_SIZE: u32 = 1 << ANS_LOG_TAB_SIZE;

/// Expected decoder state after the last symbol of a stream.
pub(crate) const ANS_FINAL_STATE: u32 = 0x130000;

/// Decode-side rANS histogram for one cluster.
///
/// Frequencies are normalized to sum to 4096. Symbols are resolved through a
/// direct 4096-entry lookup.
#[derive(Debug, Clone)]
pub struct Histogram {
    dist: Vec<u16>,
    cum: Vec<u16>,
    lut: Box<[u8; ANS_TAB_SIZE as usize]>,
    single_symbol: Option<u32>,
}

impl Histogram {
    pub fn parse(bitstream: &mut Bitstream, log_alphabet_size: u32) -> Result<Self> {
        debug_assert!((5..=8).contains(&log_alphabet_size));
        let table_size = 1usize << log_alphabet_size;

        let mut dist = vec![0u16; table_size];
        if bitstream.read_bool()? {
            // single symbol, no bits consumed by the token stream
            let sym = read_u8(bitstream)? as usize;
            if sym >= table_size {
                return Err(Error::InvalidAnsHistogram);
            }
            dist[sym] = ANS_TAB_SIZE as u16;
        } else {
            let alphabet_size = read_u8(bitstream)? as usize + 1;
            if alphabet_size > table_size {
                return Err(Error::InvalidAnsHistogram);
            }
            let mut acc = 0u32;
            for d in dist[..alphabet_size].iter_mut() {
                if bitstream.read_bool()? {
                    let freq = bitstream.read_bits(12)? as u16;
                    if freq == 0 {
                        return Err(Error::InvalidAnsHistogram);
                    }
                    *d = freq;
                    acc += freq as u32;
                }
            }
            if acc != ANS_TAB_SIZE {
                return Err(Error::InvalidAnsHistogram);
            }
        }

        Ok(Self::with_dist(dist))
    }

    pub(crate) fn with_dist(dist: Vec<u16>) -> Self {
        let mut cum = vec![0u16; dist.len()];
        let mut lut = Box::new([0u8; ANS_TAB_SIZE as usize]);
        let mut acc = 0u16;
        for (sym, (&freq, c)) in dist.iter().zip(cum.iter_mut()).enumerate() {
            *c = acc;
            for entry in lut[acc as usize..(acc as usize + freq as usize)].iter_mut() {
                *entry = sym as u8;
            }
            acc = acc.wrapping_add(freq);
        }
        let single_symbol = dist
            .iter()
            .position(|&d| d as u32 == ANS_TAB_SIZE)
            .map(|sym| sym as u32);

        Self {
            dist,
            cum,
            lut,
            single_symbol,
        }
    }

    #[inline]
    pub fn read_symbol(&self, bitstream: &mut Bitstream, state: &mut u32) -> Result<u32> {
        let idx = *state & (ANS_TAB_SIZE - 1);
        let symbol = self.lut[idx as usize] as usize;
        let freq = self.dist[symbol] as u32;
        let next_state = (*state >> ANS_LOG_TAB_SIZE) * freq + idx - self.cum[symbol] as u32;
        *state = if next_state < (1 << 16) {
            (next_state << 16) | bitstream.read_bits(16)?
        } else {
            next_state
        };
        Ok(symbol as u32)
    }

    #[inline]
    pub fn single_symbol(&self) -> Option<u32> {
        self.single_symbol
    }
}

pub(crate) fn read_u8(bitstream: &mut Bitstream) -> Result<u8> {
    Ok(if bitstream.read_bool()? {
        let n = bitstream.read_bits(3)?;
        ((1 << n) + bitstream.read_bits(n as usize)?) as u8
    } else {
        0
    })
}

pub(crate) fn write_u8(writer: &mut maans_bitstream::BitWriter, value: u8) {
    if value == 0 {
        writer.write_bool(false);
    } else {
        writer.write_bool(true);
        let n = 7 - value.leading_zeros();
        writer.write_bits(n, 3);
        writer.write_bits(value as u32 - (1 << n), n as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maans_bitstream::BitWriter;

    #[test]
    fn u8_roundtrip() {
        for value in 0..=255u8 {
            let mut writer = BitWriter::new();
            write_u8(&mut writer, value);
            let bytes = writer.finalize();
            let mut bitstream = Bitstream::new(&bytes);
            assert_eq!(read_u8(&mut bitstream).unwrap(), value);
        }
    }

    #[test]
    fn lut_matches_dist() {
        let mut dist = vec![0u16; 32];
        dist[3] = 1000;
        dist[7] = 3000;
        dist[8] = 96;
        let histogram = Histogram::with_dist(dist);
        assert_eq!(histogram.lut[0], 3);
        assert_eq!(histogram.lut[999], 3);
        assert_eq!(histogram.lut[1000], 7);
        assert_eq!(histogram.lut[3999], 7);
        assert_eq!(histogram.lut[4000], 8);
        assert_eq!(histogram.lut[4095], 8);
        assert_eq!(histogram.single_symbol(), None);
    }
}
