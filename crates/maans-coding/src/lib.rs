//! Context-clustered rANS entropy coder for the modular MA-ANS coder.
//!
//! [`Decoder`] reads hybrid-uint tokens from clustered distributions, as the
//! channel decoder needs them; the [`encode`] module provides the matching
//! histogram builder and token writer for the encoder side.

use std::sync::Arc;

use maans_bitstream::{BitWriter, Bitstream};

mod ans;
mod encode;
mod error;

pub use ans::Histogram;
pub use encode::{build_and_encode_histograms, write_tokens, EntropyCode, Token};
pub use error::{Error, Result};

use ans::ANS_FINAL_STATE;

/// Hybrid-uint configuration: values below `split` are coded directly as
/// tokens; larger values put their top `msb_in_token` and bottom
/// `lsb_in_token` bits in the token and the rest in raw extra bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegerConfig {
    split_exponent: u32,
    split: u32,
    msb_in_token: u32,
    lsb_in_token: u32,
}

impl IntegerConfig {
    pub fn new(split_exponent: u32, msb_in_token: u32, lsb_in_token: u32) -> Self {
        debug_assert!(msb_in_token + lsb_in_token <= split_exponent);
        Self {
            split_exponent,
            split: 1 << split_exponent,
            msb_in_token,
            lsb_in_token,
        }
    }

    pub fn parse(bitstream: &mut Bitstream, log_alphabet_size: u32) -> Result<Self> {
        let split_exponent_bits = add_log2_ceil(log_alphabet_size);
        let split_exponent = bitstream.read_bits(split_exponent_bits as usize)?;
        let (msb_in_token, lsb_in_token) = if split_exponent != log_alphabet_size {
            let msb_bits = add_log2_ceil(split_exponent);
            let msb_in_token = bitstream.read_bits(msb_bits as usize)?;
            if msb_in_token > split_exponent {
                return Err(Error::InvalidIntegerConfig);
            }
            let lsb_bits = add_log2_ceil(split_exponent - msb_in_token);
            let lsb_in_token = bitstream.read_bits(lsb_bits as usize)?;
            (msb_in_token, lsb_in_token)
        } else {
            (0u32, 0u32)
        };
        if lsb_in_token + msb_in_token > split_exponent {
            return Err(Error::InvalidIntegerConfig);
        }
        Ok(Self {
            split_exponent,
            split: 1 << split_exponent,
            msb_in_token,
            lsb_in_token,
        })
    }

    pub(crate) fn write(&self, writer: &mut BitWriter, log_alphabet_size: u32) {
        let split_exponent_bits = add_log2_ceil(log_alphabet_size);
        writer.write_bits(self.split_exponent, split_exponent_bits as usize);
        if self.split_exponent != log_alphabet_size {
            let msb_bits = add_log2_ceil(self.split_exponent);
            writer.write_bits(self.msb_in_token, msb_bits as usize);
            let lsb_bits = add_log2_ceil(self.split_exponent - self.msb_in_token);
            writer.write_bits(self.lsb_in_token, lsb_bits as usize);
        }
    }

    /// Recovers a value from its token and the bitstream's extra bits.
    #[inline]
    pub fn read_uint(&self, bitstream: &mut Bitstream, token: u32) -> Result<u32> {
        let &Self {
            split_exponent,
            split,
            msb_in_token,
            lsb_in_token,
        } = self;
        if token < split {
            return Ok(token);
        }

        let n = split_exponent - (msb_in_token + lsb_in_token)
            + ((token - split) >> (msb_in_token + lsb_in_token));
        if n > 32 {
            return Err(Error::InvalidIntegerConfig);
        }
        let low_bits = token & ((1 << lsb_in_token) - 1);
        let token = token >> lsb_in_token;
        let token = token & ((1 << msb_in_token) - 1);
        let token = token | (1 << msb_in_token);
        let rest_bits = bitstream.read_bits(n as usize)? as u64;
        let value = ((((token as u64) << n) | rest_bits) << lsb_in_token) | low_bits as u64;
        u32::try_from(value).map_err(|_| Error::InvalidIntegerConfig)
    }

    /// Splits a value into `(token, extra_bit_count, extra_bits)`, the exact
    /// inverse of [`Self::read_uint`].
    #[inline]
    pub fn token_split(&self, value: u32) -> (u32, u32, u32) {
        let &Self {
            split_exponent,
            split,
            msb_in_token,
            lsb_in_token,
        } = self;
        if value < split {
            return (value, 0, 0);
        }

        let bit_length = 31 - value.leading_zeros();
        let n = bit_length - msb_in_token - lsb_in_token;
        let low_bits = value & ((1 << lsb_in_token) - 1);
        let rest_bits = (value >> lsb_in_token) & ((1 << n) - 1);
        let msb_bits = (value >> (lsb_in_token + n)) & ((1 << msb_in_token) - 1);
        let m = msb_in_token + lsb_in_token;
        let token = split
            + ((((n - (split_exponent - m)) << m) | (msb_bits << lsb_in_token) | low_bits) as u32);
        (token, n, rest_bits)
    }

    #[inline]
    pub(crate) fn split(&self) -> u32 {
        self.split
    }

    /// Largest token this config produces for a `u32` value.
    pub(crate) fn max_token(&self) -> u32 {
        self.token_split(u32::MAX).0
    }
}

/// An entropy decoder over clustered distributions.
#[derive(Debug, Clone)]
pub struct Decoder {
    clusters: Vec<u8>,
    configs: Vec<IntegerConfig>,
    dist: Arc<Vec<Histogram>>,
    state: u32,
    initial: bool,
}

impl Decoder {
    /// Create a decoder by reading the cluster map, integer configurations
    /// and symbol distributions from the bitstream.
    pub fn parse(bitstream: &mut Bitstream, num_dist: u32) -> Result<Self> {
        let lz77_enabled = bitstream.read_bool()?;
        if lz77_enabled {
            tracing::error!("LZ77-enabled entropy stream");
            return Err(Error::Lz77NotSupported);
        }
        let (num_clusters, clusters) = read_clusters(bitstream, num_dist)?;
        let log_alphabet_size = 5 + bitstream.read_bits(2)?;
        let configs = (0..num_clusters)
            .map(|_| IntegerConfig::parse(bitstream, log_alphabet_size))
            .collect::<Result<Vec<_>>>()?;
        let dist = (0..num_clusters)
            .map(|_| Histogram::parse(bitstream, log_alphabet_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            clusters,
            configs,
            dist: Arc::new(dist),
            state: 0,
            initial: true,
        })
    }

    /// Explicitly start reading an entropy coded stream by loading the
    /// initial ANS state.
    pub fn begin(&mut self, bitstream: &mut Bitstream) -> Result<()> {
        self.state = bitstream.read_bits(32)?;
        self.initial = false;
        Ok(())
    }

    /// Read an integer with the given context.
    #[inline]
    pub fn read_varint(&mut self, bitstream: &mut Bitstream, ctx: u32) -> Result<u32> {
        let cluster = self.clusters[ctx as usize];
        self.read_varint_clustered(bitstream, cluster)
    }

    /// Read an integer with the given *cluster*.
    ///
    /// Contexts can be converted to clusters using [the cluster
    /// map][Self::cluster_map].
    #[inline]
    pub fn read_varint_clustered(&mut self, bitstream: &mut Bitstream, cluster: u8) -> Result<u32> {
        debug_assert!(!self.initial, "begin() not called");
        let token = self.dist[cluster as usize].read_symbol(bitstream, &mut self.state)?;
        self.configs[cluster as usize].read_uint(bitstream, token)
    }

    /// Returns the sole value of the cluster if its distribution has a
    /// single symbol carrying no extra bits.
    #[inline]
    pub fn single_token(&self, cluster: u8) -> Option<u32> {
        let single_symbol = self.dist[cluster as usize].single_symbol()?;
        (single_symbol < self.configs[cluster as usize].split()).then_some(single_symbol)
    }

    /// Finalizes the stream, checking that the ANS state unwound exactly.
    #[inline]
    pub fn finalize(&self) -> Result<()> {
        if self.state == ANS_FINAL_STATE {
            Ok(())
        } else {
            Err(Error::InvalidAnsStream)
        }
    }

    /// Returns the cluster mapping of distributions.
    #[inline]
    pub fn cluster_map(&self) -> &[u8] {
        &self.clusters
    }
}

fn add_log2_ceil(x: u32) -> u32 {
    (x + 1).next_power_of_two().trailing_zeros()
}

/// Reads the context cluster map: a bit width, then one entry per context.
fn read_clusters(bitstream: &mut Bitstream, num_dist: u32) -> Result<(u32, Vec<u8>)> {
    if num_dist == 1 {
        return Ok((1, vec![0u8]));
    }

    let nbits = bitstream.read_bits(4)?;
    if nbits > 8 {
        return Err(Error::InvalidClusterMap);
    }
    let clusters = (0..num_dist)
        .map(|_| bitstream.read_bits(nbits as usize).map(|b| b as u8))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let num_clusters = *clusters.iter().max().unwrap() as u32 + 1;
    Ok((num_clusters, clusters))
}

pub(crate) fn write_clusters(writer: &mut BitWriter, clusters: &[u8]) {
    if clusters.len() == 1 {
        return;
    }

    let num_clusters = *clusters.iter().max().unwrap() as u32 + 1;
    let nbits = add_log2_ceil(num_clusters - 1);
    writer.write_bits(nbits, 4);
    for &cluster in clusters {
        writer.write_bits(cluster as u32, nbits as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_split_inverts_read_uint() {
        let config = IntegerConfig::new(4, 1, 0);
        for value in (0u32..5000).chain([u32::MAX, u32::MAX - 1, 1 << 31, (1 << 20) + 123]) {
            let (token, nbits, bits) = config.token_split(value);
            let mut writer = BitWriter::new();
            writer.write_bits(bits, nbits as usize);
            let bytes = writer.finalize();
            let mut bitstream = Bitstream::new(&bytes);
            assert_eq!(config.read_uint(&mut bitstream, token).unwrap(), value);
        }
    }

    #[test]
    fn token_split_with_lsb() {
        let config = IntegerConfig::new(4, 1, 1);
        for value in (0u32..5000).chain([u32::MAX, 1 << 27]) {
            let (token, nbits, bits) = config.token_split(value);
            let mut writer = BitWriter::new();
            writer.write_bits(bits, nbits as usize);
            let bytes = writer.finalize();
            let mut bitstream = Bitstream::new(&bytes);
            assert_eq!(config.read_uint(&mut bitstream, token).unwrap(), value);
        }
    }

    #[test]
    fn max_token_fits_in_alphabet() {
        let config = IntegerConfig::new(4, 1, 0);
        assert!(config.max_token() < 128);
    }

    #[test]
    fn cluster_roundtrip() {
        let clusters = vec![0u8, 1, 2, 1, 0, 3, 9];
        let mut writer = BitWriter::new();
        write_clusters(&mut writer, &clusters);
        let bytes = writer.finalize();
        let mut bitstream = Bitstream::new(&bytes);
        let (num_clusters, read) = read_clusters(&mut bitstream, clusters.len() as u32).unwrap();
        assert_eq!(num_clusters, 10);
        assert_eq!(read, clusters);
    }
}
