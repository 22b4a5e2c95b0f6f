//! Encoder side: histogram building, clustering and token writing.
//!
//! The stream produced here is read back by [`Decoder`]: one histogram
//! section per entropy-coded segment, then a 32-bit initial ANS state
//! followed by the token payload with interleaved renormalization words and
//! hybrid-uint extra bits.
//!
//! [`Decoder`]: crate::Decoder

use maans_bitstream::BitWriter;

use crate::ans::{write_u8, ANS_FINAL_STATE, ANS_LOG_TAB_SIZE, ANS_TAB_SIZE};
use crate::{write_clusters, IntegerConfig};

/// One entropy-coded integer, tagged with its (unclustered) context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub context: u32,
    pub value: u32,
}

impl Token {
    #[inline]
    pub fn new(context: u32, value: u32) -> Self {
        Self { context, value }
    }
}

/// Encoder-side entropy code: the cluster map plus normalized frequencies
/// per cluster.
#[derive(Debug)]
pub struct EntropyCode {
    clusters: Vec<u8>,
    config: IntegerConfig,
    freqs: Vec<Vec<u16>>,
    cums: Vec<Vec<u16>>,
}

impl EntropyCode {
    /// Returns the context-to-cluster map.
    #[inline]
    pub fn context_map(&self) -> &[u8] {
        &self.clusters
    }
}

/// Builds per-context histograms over `tokens`, clusters identical ones,
/// and writes the histogram section.
///
/// Every `token.context` must be below `num_contexts`.
pub fn build_and_encode_histograms(
    num_contexts: usize,
    tokens: &[Token],
    writer: &mut BitWriter,
) -> EntropyCode {
    let config = IntegerConfig::new(4, 1, 0);

    let mut max_symbol = 0u32;
    let mut counts = vec![Vec::<u32>::new(); num_contexts];
    for token in tokens {
        let (symbol, _, _) = config.token_split(token.value);
        let count = &mut counts[token.context as usize];
        if count.len() <= symbol as usize {
            count.resize(symbol as usize + 1, 0);
        }
        count[symbol as usize] += 1;
        max_symbol = max_symbol.max(symbol);
    }

    // Merge contexts with identical histograms. Overflow beyond 256
    // clusters is folded into the last one, which only costs compression.
    let mut clusters = vec![0u8; num_contexts.max(1)];
    let mut unique: Vec<Vec<u32>> = Vec::new();
    for (ctx, count) in counts.iter().enumerate() {
        match unique.iter().position(|u| u == count) {
            Some(idx) => clusters[ctx] = idx as u8,
            None if unique.len() < 256 => {
                clusters[ctx] = unique.len() as u8;
                unique.push(count.clone());
            }
            None => {
                clusters[ctx] = 255;
                let merged = &mut unique[255];
                if merged.len() < count.len() {
                    merged.resize(count.len(), 0);
                }
                for (m, &c) in merged.iter_mut().zip(count) {
                    *m += c;
                }
            }
        }
    }
    if unique.is_empty() {
        unique.push(Vec::new());
    }

    let log_alphabet_size = 32u32
        .saturating_sub((max_symbol + 1).leading_zeros())
        .max(5)
        .min(8);

    writer.write_bool(false); // lz77_enabled
    write_clusters(writer, &clusters);
    writer.write_bits(log_alphabet_size - 5, 2);
    for _ in 0..unique.len() {
        config.write(writer, log_alphabet_size);
    }

    let mut freqs = Vec::with_capacity(unique.len());
    let mut cums = Vec::with_capacity(unique.len());
    for count in &unique {
        let dist = normalize_counts(count);
        write_histogram(writer, &dist);
        let mut cum = vec![0u16; dist.len()];
        let mut acc = 0u16;
        for (&freq, c) in dist.iter().zip(cum.iter_mut()) {
            *c = acc;
            acc = acc.wrapping_add(freq);
        }
        freqs.push(dist);
        cums.push(cum);
    }

    EntropyCode {
        clusters,
        config,
        freqs,
        cums,
    }
}

/// Entropy-codes `tokens` with a prebuilt code.
///
/// rANS is last-in first-out: symbols are folded into the state in reverse,
/// recording where the decoder will renormalize, and the stream is then laid
/// out in forward decode order.
pub fn write_tokens(tokens: &[Token], code: &EntropyCode, writer: &mut BitWriter) {
    struct PlannedToken {
        cluster: u8,
        symbol: u32,
        nbits: u32,
        bits: u32,
    }

    let planned: Vec<PlannedToken> = tokens
        .iter()
        .map(|token| {
            let (symbol, nbits, bits) = code.config.token_split(token.value);
            PlannedToken {
                cluster: code.clusters[token.context as usize],
                symbol,
                nbits,
                bits,
            }
        })
        .collect();

    let mut state: u32 = ANS_FINAL_STATE;
    let mut flushes: Vec<Option<u16>> = vec![None; planned.len()];
    for (token, flush) in planned.iter().zip(flushes.iter_mut()).rev() {
        let freq = code.freqs[token.cluster as usize][token.symbol as usize] as u32;
        let cum = code.cums[token.cluster as usize][token.symbol as usize] as u32;
        debug_assert!(freq > 0);
        if (state as u64) >= ((freq as u64) << 20) {
            *flush = Some(state as u16);
            state >>= 16;
        }
        state = ((state / freq) << ANS_LOG_TAB_SIZE) + (state % freq) + cum;
    }

    writer.write_bits(state, 32);
    for (token, flush) in planned.iter().zip(&flushes) {
        if let Some(word) = flush {
            writer.write_bits(*word as u32, 16);
        }
        writer.write_bits(token.bits, token.nbits as usize);
    }
}

/// Scales raw counts to 12-bit frequencies summing to exactly 4096, keeping
/// every observed symbol representable.
fn normalize_counts(counts: &[u32]) -> Vec<u16> {
    let total: u64 = counts.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return vec![ANS_TAB_SIZE as u16];
    }

    let alphabet_size = counts.len();
    let mut dist = vec![0u16; alphabet_size];
    let mut acc = 0i64;
    for (&count, freq) in counts.iter().zip(dist.iter_mut()) {
        if count == 0 {
            continue;
        }
        let scaled = ((count as u64 * ANS_TAB_SIZE as u64 + total / 2) / total).max(1);
        *freq = scaled.min(ANS_TAB_SIZE as u64) as u16;
        acc += *freq as i64;
    }

    let mut diff = ANS_TAB_SIZE as i64 - acc;
    while diff != 0 {
        let largest = dist
            .iter()
            .enumerate()
            .max_by_key(|(_, &f)| f)
            .map(|(i, _)| i)
            .unwrap();
        if diff > 0 {
            dist[largest] = (dist[largest] as i64 + diff) as u16;
            diff = 0;
        } else {
            let take = (-diff).min(dist[largest] as i64 - 1);
            dist[largest] -= take as u16;
            diff += take;
            debug_assert!(take > 0, "cannot normalize histogram");
        }
    }
    dist
}

fn write_histogram(writer: &mut BitWriter, dist: &[u16]) {
    if let Some(sym) = dist.iter().position(|&f| f as u32 == ANS_TAB_SIZE) {
        writer.write_bool(true);
        write_u8(writer, sym as u8);
        return;
    }

    writer.write_bool(false);
    let alphabet_size = dist.len();
    write_u8(writer, (alphabet_size - 1) as u8);
    for &freq in dist {
        if freq == 0 {
            writer.write_bool(false);
        } else {
            writer.write_bool(true);
            writer.write_bits(freq as u32, 12);
        }
    }
}
