//! Sorted key/value blocks that can stay serialized until read.

use once_cell::unsync::OnceCell;

use super::codec;
use crate::error::{FramedexError, Result};
use crate::types::{Key, Pair, Value};

/// A sorted run of unique keys with their values.
///
/// `min_key`/`max_key` are estimates: never tighter than the true bounds. The
/// pairs and their encoding are each materialized on demand from the other.
#[derive(Debug, Clone)]
pub struct Frame {
    pairs: OnceCell<Vec<Pair>>,
    encoded: OnceCell<Vec<u8>>,
    min_key: Key,
    max_key: Key,
    len: usize,
    record_seek: Option<u64>,
}

impl Frame {
    /// Build from pairs already in strictly ascending key order.
    pub fn from_sorted(pairs: Vec<Pair>) -> Self {
        let min_key = pairs.first().map(|(k, _)| k.clone()).unwrap_or_default();
        let max_key = pairs.last().map(|(k, _)| k.clone()).unwrap_or_default();
        let len = pairs.len();
        Self {
            pairs: OnceCell::from(pairs),
            encoded: OnceCell::new(),
            min_key,
            max_key,
            len,
            record_seek: None,
        }
    }

    /// Build from unordered pairs. Later duplicates win.
    pub fn from_unsorted(pairs: impl IntoIterator<Item = Pair>) -> Self {
        let map: std::collections::BTreeMap<Key, Value> = pairs.into_iter().collect();
        Self::from_sorted(map.into_iter().collect())
    }

    /// An unexploded frame over an encoded payload.
    pub fn from_encoded(
        encoded: Vec<u8>,
        min_key: Key,
        max_key: Key,
        len: usize,
        record_seek: Option<u64>,
    ) -> Self {
        Self {
            pairs: OnceCell::new(),
            encoded: OnceCell::from(encoded),
            min_key,
            max_key,
            len,
            record_seek,
        }
    }

    pub fn empty() -> Self {
        Self::from_sorted(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_exploded(&self) -> bool {
        self.pairs.get().is_some()
    }

    /// Estimated lower bound.
    pub fn min_key(&self) -> &Key {
        &self.min_key
    }

    /// Estimated upper bound.
    pub fn max_key(&self) -> &Key {
        &self.max_key
    }

    /// Offset of the file record this frame was loaded from.
    pub fn record_seek(&self) -> Option<u64> {
        self.record_seek
    }

    /// Replace the bound estimates. Callers must keep them at least as wide as the truth.
    #[must_use]
    pub fn with_bounds(mut self, min_key: Option<Key>, max_key: Option<Key>) -> Self {
        if let Some(min) = min_key {
            self.min_key = min;
        }
        if let Some(max) = max_key {
            self.max_key = max;
        }
        self
    }

    pub fn pairs(&self) -> Result<&[Pair]> {
        let pairs = self.pairs.get_or_try_init(|| -> Result<Vec<Pair>> {
            let raw = self.encoded.get().map_or(&[][..], Vec::as_slice);
            let pairs: Vec<Pair> = codec::decode(raw)?;
            if pairs.len() != self.len {
                return Err(FramedexError::corrupt(
                    "<frame>",
                    format!("expected {} pairs, decoded {}", self.len, pairs.len()),
                ));
            }
            Ok(pairs)
        })?;
        Ok(pairs)
    }

    pub fn into_pairs(self) -> Result<Vec<Pair>> {
        self.pairs()?;
        Ok(self.pairs.into_inner().unwrap_or_default())
    }

    /// The serialized payload.
    pub fn encoded(&self) -> Result<&[u8]> {
        let raw = self
            .encoded
            .get_or_try_init(|| codec::encode(&self.pairs.get().map_or(&[][..], Vec::as_slice)))?;
        Ok(raw)
    }

    /// Encoded payload length in bytes.
    pub fn byte_size(&self) -> Result<usize> {
        Ok(self.encoded()?.len())
    }

    pub fn true_min(&self) -> Result<Option<&Key>> {
        Ok(self.pairs()?.first().map(|(k, _)| k))
    }

    pub fn true_max(&self) -> Result<Option<&Key>> {
        Ok(self.pairs()?.last().map(|(k, _)| k))
    }

    /// Tighten the estimates to the true bounds.
    pub fn exact_bounds(self) -> Result<Self> {
        let (min, max) = {
            let pairs = self.pairs()?;
            (
                pairs.first().map(|(k, _)| k.clone()),
                pairs.last().map(|(k, _)| k.clone()),
            )
        };
        Ok(self.with_bounds(min, max))
    }

    /// Position of the first key `>= key`.
    pub fn index_of(&self, key: &Key) -> Result<usize> {
        Ok(self.pairs()?.partition_point(|(k, _)| k < key))
    }

    /// First pair whose key is `>= key`.
    pub fn at_or_next(&self, key: &Key) -> Result<Option<&Pair>> {
        let idx = self.index_of(key)?;
        Ok(self.pairs()?.get(idx))
    }

    pub fn get(&self, key: &Key) -> Result<Option<&Value>> {
        Ok(self
            .at_or_next(key)?
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Sub-frame of pairs in `[start, end)` by position, with exact bounds.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        let pairs = self.pairs()?;
        let end = end.min(pairs.len());
        let start = start.min(end);
        Ok(Self::from_sorted(pairs[start..end].to_vec()))
    }

    /// Whether the estimated bounds could contain `key`.
    pub fn may_contain(&self, key: &Key) -> bool {
        self.min_key <= *key && *key <= self.max_key
    }

    /// Verify strict ascending order of the materialized keys.
    pub fn check_order(&self) -> Result<()> {
        let pairs = self.pairs()?;
        for window in pairs.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(FramedexError::out_of_order(format!(
                    "{} then {} inside one frame",
                    window[0].0, window[1].0
                )));
            }
        }
        Ok(())
    }
}

/// Encoded size of a single pair, used when splitting frames by bytes.
pub fn pair_size(pair: &Pair) -> Result<usize> {
    Ok(codec::encode(pair)?.len())
}
