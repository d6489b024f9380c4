//! Rateless invertible Bloom lookup table codec.
//!
//! Encodes a set of `(entry hash, coordinate)` items into an unbounded
//! stream of coded symbols; two peers exchanging symbols recover exactly
//! the symmetric difference of their sets, with communication proportional
//! to the difference size rather than the set size.
//!
//! Each item participates in coded symbol `0` and in later symbols with
//! density ~`1/(1 + i/2)`, chosen by a pseudo-random index sequence seeded
//! from the item itself, so both sides derive identical mappings without
//! coordination. The decoder subtracts its own symbol stream from the
//! remote one and peels the difference: any symbol holding exactly one
//! item (count `±1`, checksum matching) reveals that item and is folded
//! out of every other symbol it maps to.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use driftlog_primitives::{Coordinate, EntryHash, WireSymbol, SYMBOL_PAYLOAD_LEN};
use sha2::Digest;

/// A set member in codec form: 32-byte hash followed by the 8-byte
/// little-endian coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolItem {
    payload: [u8; SYMBOL_PAYLOAD_LEN],
}

impl SymbolItem {
    #[must_use]
    pub fn new(hash: EntryHash, coordinate: Coordinate) -> Self {
        let mut payload = [0_u8; SYMBOL_PAYLOAD_LEN];
        payload[..32].copy_from_slice(hash.as_bytes());
        payload[32..].copy_from_slice(&coordinate.to_le_bytes());
        Self { payload }
    }

    #[must_use]
    pub fn hash(&self) -> EntryHash {
        let mut bytes = [0_u8; 32];
        bytes.copy_from_slice(&self.payload[..32]);
        EntryHash::from(bytes)
    }

    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&self.payload[32..]);
        Coordinate::from_le_bytes(bytes)
    }

    /// Truncated digest folded into symbols to detect pure singletons.
    #[must_use]
    pub fn checksum(&self) -> [u8; 8] {
        let digest = sha2::Sha256::digest(self.payload);
        let mut checksum = [0_u8; 8];
        checksum.copy_from_slice(&digest[..8]);
        checksum
    }

    /// Seed for the index sequence, derived from the checksum digest so
    /// the mapping is a pure function of the item.
    fn seed(&self) -> u64 {
        let digest = sha2::Sha256::digest(self.payload);
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&digest[8..16]);
        u64::from_le_bytes(bytes)
    }
}

/// Pseudo-random sequence of coded-symbol indices an item maps to.
///
/// First index is always `0`; successive gaps grow so that the expected
/// participation density at index `i` is ~`1/(1 + i/2)`.
#[derive(Clone, Copy, Debug)]
struct IndexSequence {
    prng: u64,
    index: u64,
}

impl IndexSequence {
    fn new(seed: u64) -> Self {
        Self {
            // A zero seed would get stuck at zero through the
            // multiplicative step.
            prng: seed | 1,
            index: 0,
        }
    }

    fn current(&self) -> u64 {
        self.index
    }

    fn advance(&mut self) -> u64 {
        self.prng = self.prng.wrapping_mul(0xda94_2042_e4dd_58b5);
        // Top 32 bits as a uniform draw; the gap is sampled so that the
        // participation density at index i is ~1/(1 + i/2).
        let draw = (self.prng >> 32) as f64 + 1.0;
        let scale = 65_536.0 / draw.sqrt();
        let gap = ((self.index as f64 + 1.5) * (scale - 1.0)).ceil().max(1.0);
        self.index = self.index.saturating_add(gap as u64);
        self.index
    }
}

fn zero_symbol() -> WireSymbol {
    WireSymbol {
        sum: [0; SYMBOL_PAYLOAD_LEN],
        checksum: [0; 8],
        count: 0,
    }
}

fn fold(symbol: &mut WireSymbol, item: &SymbolItem, direction: i64) {
    for (acc, byte) in symbol.sum.iter_mut().zip(item.payload) {
        *acc ^= byte;
    }
    for (acc, byte) in symbol.checksum.iter_mut().zip(item.checksum()) {
        *acc ^= byte;
    }
    symbol.count += direction;
}

fn is_zero(symbol: &WireSymbol) -> bool {
    symbol.count == 0
        && symbol.sum.iter().all(|b| *b == 0)
        && symbol.checksum.iter().all(|b| *b == 0)
}

/// Whether a symbol currently holds exactly one item.
fn singleton(symbol: &WireSymbol) -> Option<(SymbolItem, i64)> {
    if symbol.count != 1 && symbol.count != -1 {
        return None;
    }
    let item = SymbolItem {
        payload: symbol.sum,
    };
    (item.checksum() == symbol.checksum).then_some((item, symbol.count))
}

/// Incremental coded-symbol producer over a fixed item set.
///
/// Items are added up front (seeded from an index scan); symbols are then
/// produced on demand, any number of them. The same encoder yields the
/// same stream every time, which is what makes caching it per span safe.
#[derive(Clone, Debug, Default)]
pub struct Encoder {
    items: Vec<(SymbolItem, IndexSequence)>,
    /// Min-heap of `(next index, item position)`.
    queue: BinaryHeap<Reverse<(u64, usize)>>,
    next_index: u64,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of symbols produced so far.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.next_index
    }

    /// Add an item. Only valid before production starts; the orchestrator
    /// rebuilds the encoder instead of mutating one mid-stream.
    pub fn add_item(&mut self, hash: EntryHash, coordinate: Coordinate) {
        debug_assert_eq!(self.next_index, 0, "encoder is already producing");
        let item = SymbolItem::new(hash, coordinate);
        let sequence = IndexSequence::new(item.seed());
        let position = self.items.len();
        self.queue.push(Reverse((sequence.current(), position)));
        self.items.push((item, sequence));
    }

    /// Produce the next coded symbol in the stream.
    pub fn produce_next(&mut self) -> WireSymbol {
        let index = self.next_index;
        self.next_index += 1;

        let mut symbol = zero_symbol();
        while let Some(Reverse((at, position))) = self.queue.peek().copied() {
            if at > index {
                break;
            }
            let _ = self.queue.pop();
            let (item, sequence) = &mut self.items[position];
            fold(&mut symbol, item, 1);
            let next = sequence.advance();
            self.queue.push(Reverse((next, position)));
        }
        symbol
    }

    /// Produce a batch of symbols.
    pub fn produce(&mut self, count: usize) -> Vec<WireSymbol> {
        (0..count).map(|_| self.produce_next()).collect()
    }
}

/// Outcome of a successful decode: the symmetric difference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Items only the remote side has.
    pub remote_only: Vec<(EntryHash, Coordinate)>,
    /// Items only the local side has.
    pub local_only: Vec<(EntryHash, Coordinate)>,
}

/// Streaming decoder: seeded with the local item set, fed remote symbols.
#[derive(Clone, Debug, Default)]
pub struct Decoder {
    local: Encoder,
    /// Difference stream: `remote[i] - local[i]`.
    difference: Vec<WireSymbol>,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with one locally-present item. Must happen before feeding.
    pub fn add_local(&mut self, hash: EntryHash, coordinate: Coordinate) {
        self.local.add_item(hash, coordinate);
    }

    /// Number of remote symbols consumed.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.difference.len()
    }

    /// Feed the next remote coded symbol (in stream order).
    pub fn feed(&mut self, remote: WireSymbol) {
        let mut diff = remote;
        let local = self.local.produce_next();
        // Subtracting a symbol is XOR on the sums and signed subtraction
        // on the count.
        for (acc, byte) in diff.sum.iter_mut().zip(local.sum) {
            *acc ^= byte;
        }
        for (acc, byte) in diff.checksum.iter_mut().zip(local.checksum) {
            *acc ^= byte;
        }
        diff.count -= local.count;
        self.difference.push(diff);
    }

    /// Attempt to decode with the symbols consumed so far.
    ///
    /// Peels a scratch copy of the difference stream; `None` means
    /// inconclusive (feed more symbols and retry). Success returns the
    /// exact symmetric difference.
    #[must_use]
    pub fn try_decode(&self) -> Option<Decoded> {
        let mut scratch = self.difference.clone();
        let mut decoded = Decoded::default();

        loop {
            let found = scratch
                .iter()
                .enumerate()
                .find_map(|(at, symbol)| singleton(symbol).map(|hit| (at, hit)));
            let Some((_, (item, direction))) = found else {
                break;
            };
            // Fold the recovered item out of every symbol it maps to.
            let mut sequence = IndexSequence::new(item.seed());
            loop {
                let index = sequence.current() as usize;
                if index >= scratch.len() {
                    break;
                }
                fold(&mut scratch[index], &item, -direction);
                let _ = sequence.advance();
            }
            let pair = (item.hash(), item.coordinate());
            if direction > 0 {
                decoded.remote_only.push(pair);
            } else {
                decoded.local_only.push(pair);
            }
        }

        scratch.iter().all(is_zero).then(|| {
            decoded.remote_only.sort_unstable();
            decoded.local_only.sort_unstable();
            decoded
        })
    }
}
