//! Lazy adapters over sorted frame sequences.
//!
//! A [`FrameStream`] yields frames whose keys ascend strictly across the whole
//! sequence. Adapters never explode a frame unless its estimated bounds make
//! that necessary.

use std::collections::VecDeque;

use super::frame::{Frame, pair_size};
use super::heuristics::{between, larger, smaller};
use crate::error::{FramedexError, Result};
use crate::types::{Key, Pair};

pub type FrameStream<'a> = Box<dyn Iterator<Item = Result<Frame>> + 'a>;

pub fn from_frames<'a>(frames: Vec<Frame>) -> FrameStream<'a> {
    Box::new(frames.into_iter().map(Ok))
}

pub fn empty<'a>() -> FrameStream<'a> {
    Box::new(std::iter::empty())
}

/// Chunk an ascending pair sequence into frames of roughly `chunk_bytes`.
pub fn from_sorted_pairs<'a>(
    pairs: impl IntoIterator<Item = Pair> + 'a,
    chunk_bytes: usize,
) -> FrameStream<'a> {
    Box::new(PairChunks {
        pairs: Box::new(pairs.into_iter()),
        chunk_bytes: chunk_bytes.max(1),
    })
}

struct PairChunks<'a> {
    pairs: Box<dyn Iterator<Item = Pair> + 'a>,
    chunk_bytes: usize,
}

impl Iterator for PairChunks<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::new();
        let mut bytes = 0;
        for pair in self.pairs.by_ref() {
            match pair_size(&pair) {
                Ok(size) => bytes += size,
                Err(err) => return Some(Err(err)),
            }
            chunk.push(pair);
            if bytes >= self.chunk_bytes {
                break;
            }
        }
        (!chunk.is_empty()).then(|| Ok(Frame::from_sorted(chunk)))
    }
}

/// Drain a stream into its pairs.
pub fn collect_pairs(stream: FrameStream<'_>) -> Result<Vec<Pair>> {
    let mut out = Vec::new();
    for frame in stream {
        out.extend(frame?.into_pairs()?);
    }
    Ok(out)
}

/// A stream with a one-frame push-back slot. Empty frames are skipped.
struct Pending<'a> {
    source: FrameStream<'a>,
    slot: Option<Frame>,
}

impl<'a> Pending<'a> {
    fn new(source: FrameStream<'a>) -> Self {
        Self { source, slot: None }
    }

    fn pull(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.slot.take() {
            return Ok(Some(frame));
        }
        for frame in self.source.by_ref() {
            let frame = frame?;
            if !frame.is_empty() {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn push_back(&mut self, frame: Frame) {
        debug_assert!(self.slot.is_none());
        self.slot = Some(frame);
    }
}

/// Two-way merge. On equal keys the left value wins when `prefer_left`.
pub fn merge<'a>(left: FrameStream<'a>, right: FrameStream<'a>, prefer_left: bool) -> FrameStream<'a> {
    Box::new(Merge {
        left: Pending::new(left),
        right: Pending::new(right),
        prefer_left,
    })
}

struct Merge<'a> {
    left: Pending<'a>,
    right: Pending<'a>,
    prefer_left: bool,
}

impl Merge<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        let a = self.left.pull()?;
        let b = self.right.pull()?;
        let (a, b) = match (a, b) {
            (None, None) => return Ok(None),
            (Some(a), None) => return Ok(Some(a)),
            (None, Some(b)) => return Ok(Some(b)),
            (Some(a), Some(b)) => (a, b),
        };
        if a.max_key() < b.min_key() {
            self.right.push_back(b);
            return Ok(Some(a));
        }
        if b.max_key() < a.min_key() {
            self.left.push_back(a);
            return Ok(Some(b));
        }
        // Overlapping estimates: shuffle until one side runs out.
        let left = a.into_pairs()?;
        let right = b.into_pairs()?;
        let mut out = Vec::with_capacity(left.len() + right.len());
        let mut li = left.into_iter().peekable();
        let mut ri = right.into_iter().peekable();
        while let (Some(l), Some(r)) = (li.peek(), ri.peek()) {
            match l.0.cmp(&r.0) {
                std::cmp::Ordering::Less => out.extend(li.next()),
                std::cmp::Ordering::Greater => out.extend(ri.next()),
                std::cmp::Ordering::Equal => {
                    let (l, r) = (li.next(), ri.next());
                    out.extend(if self.prefer_left { l } else { r });
                }
            }
        }
        let rest_left: Vec<Pair> = li.collect();
        let rest_right: Vec<Pair> = ri.collect();
        if !rest_left.is_empty() {
            self.left.push_back(Frame::from_sorted(rest_left));
        }
        if !rest_right.is_empty() {
            self.right.push_back(Frame::from_sorted(rest_right));
        }
        Ok(Some(Frame::from_sorted(out)))
    }
}

impl Iterator for Merge<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Balanced merge of many streams. Earlier streams win when `prefer_left`.
pub fn multi_merge<'a>(mut streams: Vec<FrameStream<'a>>, prefer_left: bool) -> FrameStream<'a> {
    match streams.len() {
        0 => empty(),
        1 => streams.remove(0),
        n => {
            let right = streams.split_off(n / 2);
            merge(
                multi_merge(streams, prefer_left),
                multi_merge(right, prefer_left),
                prefer_left,
            )
        }
    }
}

/// Bounds for [`range`].
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub low: Option<Key>,
    pub high: Option<Key>,
    pub exclude_low: bool,
    pub exclude_high: bool,
}

impl KeyRange {
    pub fn from(low: Key) -> Self {
        Self {
            low: Some(low),
            ..Self::default()
        }
    }

    pub fn between(low: Key, high: Key) -> Self {
        Self {
            low: Some(low),
            high: Some(high),
            ..Self::default()
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.low {
            None => true,
            Some(low) if self.exclude_low => key > low,
            Some(low) => key >= low,
        };
        let below = match &self.high {
            None => true,
            Some(high) if self.exclude_high => key < high,
            Some(high) => key <= high,
        };
        above && below
    }

    fn before_low(&self, key: &Key) -> bool {
        match &self.low {
            None => false,
            Some(low) if self.exclude_low => key <= low,
            Some(low) => key < low,
        }
    }

    fn past_high(&self, key: &Key) -> bool {
        match &self.high {
            None => false,
            Some(high) if self.exclude_high => key >= high,
            Some(high) => key > high,
        }
    }
}

/// Restrict a stream to keys in `bounds`. Frames wholly inside pass unexploded.
pub fn range<'a>(source: FrameStream<'a>, bounds: KeyRange) -> FrameStream<'a> {
    Box::new(Range {
        source: Some(source),
        bounds,
    })
}

struct Range<'a> {
    source: Option<FrameStream<'a>>,
    bounds: KeyRange,
}

impl Range<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(source) = self.source.as_mut() else {
                return Ok(None);
            };
            let Some(frame) = source.next().transpose()? else {
                self.source = None;
                return Ok(None);
            };
            if frame.is_empty() || self.bounds.before_low(frame.max_key()) {
                continue;
            }
            if self.bounds.past_high(frame.min_key()) {
                self.source = None;
                return Ok(None);
            }
            if self.bounds.low.as_ref().is_none_or(|low| frame.min_key() > low)
                && self.bounds.high.as_ref().is_none_or(|high| frame.max_key() < high)
            {
                return Ok(Some(frame));
            }
            let pairs = frame.pairs()?;
            let start = pairs.partition_point(|(k, _)| self.bounds.before_low(k));
            let end = pairs.partition_point(|(k, _)| !self.bounds.past_high(k));
            if end < pairs.len() {
                self.source = None;
            }
            if start < end {
                return Ok(Some(frame.slice(start, end)?));
            }
            if self.source.is_none() {
                return Ok(None);
            }
        }
    }
}

impl Iterator for Range<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Split frames whose encoded size exceeds `target_bytes`.
pub fn split_too_large<'a>(source: FrameStream<'a>, target_bytes: usize) -> FrameStream<'a> {
    Box::new(SplitTooLarge {
        source,
        target_bytes: target_bytes.max(1),
        queue: VecDeque::new(),
    })
}

struct SplitTooLarge<'a> {
    source: FrameStream<'a>,
    target_bytes: usize,
    queue: VecDeque<Frame>,
}

impl SplitTooLarge<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.queue.pop_front() {
            return Ok(Some(frame));
        }
        let Some(frame) = self.source.next().transpose()? else {
            return Ok(None);
        };
        if frame.byte_size()? <= self.target_bytes {
            return Ok(Some(frame));
        }
        let mut piece = Vec::new();
        let mut size = 0;
        for pair in frame.into_pairs()? {
            size += pair_size(&pair)?;
            piece.push(pair);
            if size > self.target_bytes {
                self.queue.push_back(Frame::from_sorted(std::mem::take(&mut piece)));
                size = 0;
            }
        }
        if !piece.is_empty() {
            self.queue.push_back(Frame::from_sorted(piece));
        }
        Ok(self.queue.pop_front())
    }
}

impl Iterator for SplitTooLarge<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

#[derive(Clone, Copy)]
enum Measure {
    Bytes,
    Count,
}

impl Measure {
    fn of(self, frame: &Frame) -> Result<usize> {
        match self {
            Self::Bytes => frame.byte_size(),
            Self::Count => Ok(frame.len()),
        }
    }
}

/// A frame below `min_bytes` absorbs its successors until the group reaches `min_bytes`.
pub fn join_too_small_by_bytes<'a>(source: FrameStream<'a>, min_bytes: usize) -> FrameStream<'a> {
    Box::new(JoinTooSmall {
        source: Pending::new(source),
        threshold: min_bytes,
        measure: Measure::Bytes,
    })
}

/// Like [`join_too_small_by_bytes`] but measured in pairs.
pub fn join_too_small_by_count<'a>(source: FrameStream<'a>, min_count: usize) -> FrameStream<'a> {
    Box::new(JoinTooSmall {
        source: Pending::new(source),
        threshold: min_count,
        measure: Measure::Count,
    })
}

struct JoinTooSmall<'a> {
    source: Pending<'a>,
    threshold: usize,
    measure: Measure,
}

impl JoinTooSmall<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        let Some(first) = self.source.pull()? else {
            return Ok(None);
        };
        let mut total = self.measure.of(&first)?;
        if total >= self.threshold {
            return Ok(Some(first));
        }
        let mut pairs = first.into_pairs()?;
        while total < self.threshold {
            let Some(next) = self.source.pull()? else {
                break;
            };
            total += self.measure.of(&next)?;
            pairs.extend(next.into_pairs()?);
        }
        Ok(Some(Frame::from_sorted(pairs)))
    }
}

impl Iterator for JoinTooSmall<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Split frames over `too_large` bytes, then join runs under `too_small` bytes.
pub fn adjust_sizes<'a>(source: FrameStream<'a>, too_large: usize, too_small: usize) -> FrameStream<'a> {
    join_too_small_by_bytes(split_too_large(source, too_large), too_small)
}

/// Drop the first frame when all of its keys are at or before `from`.
///
/// This is the non-inclusive start shared by every frame source: later frames
/// pass untouched, and a kept first frame may still hold keys up to `from`.
pub fn skip_leading_upto<'a>(source: FrameStream<'a>, from: Key) -> FrameStream<'a> {
    let mut pending = Some(from);
    Box::new(source.filter_map(move |frame| {
        let Some(from) = pending.take() else {
            return Some(frame);
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        let skip = match frame.true_max() {
            Ok(max) => max.is_some_and(|max| *max <= from),
            Err(err) => return Some(Err(err)),
        };
        (!skip).then_some(Ok(frame))
    }))
}

/// Drop tombstones. Unless `inclusive`, a cleaned frame whose last key is at or
/// before `from` is skipped entirely.
pub fn remove_tombstones<'a>(
    source: FrameStream<'a>,
    from: Option<Key>,
    inclusive: bool,
) -> FrameStream<'a> {
    Box::new(source.filter_map(move |frame| {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        let pairs = match frame.pairs() {
            Ok(pairs) => pairs,
            Err(err) => return Some(Err(err)),
        };
        if !pairs.iter().any(|(_, v)| v.is_tombstone()) {
            return Some(Ok(frame));
        }
        let kept: Vec<Pair> = pairs
            .iter()
            .filter(|(_, v)| !v.is_tombstone())
            .cloned()
            .collect();
        let last = kept.last()?;
        if !inclusive && from.as_ref().is_some_and(|from| *from >= last.0) {
            return None;
        }
        Some(Ok(Frame::from_sorted(kept)))
    }))
}

/// Replace bound estimates with compact separators between neighbouring frames.
///
/// Apparent overlaps are rechecked against the true bounds; a real overlap is
/// an ordering violation.
pub fn truncate_key_stats<'a>(source: FrameStream<'a>) -> FrameStream<'a> {
    Box::new(TruncateKeyStats {
        source,
        previous: None,
        previous_max: None,
        done: false,
    })
}

struct TruncateKeyStats<'a> {
    source: FrameStream<'a>,
    previous: Option<Frame>,
    previous_max: Option<Key>,
    done: bool,
}

impl TruncateKeyStats<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(mut frame) = self.source.next().transpose()? else {
                self.done = true;
                return match (self.previous.take(), self.previous_max.take()) {
                    (Some(last), Some(max)) => Ok(Some(last.with_bounds(None, Some(larger(&max))))),
                    _ => Ok(None),
                };
            };
            if frame.is_empty() {
                continue;
            }
            let Some(last) = self.previous.take() else {
                let min = smaller(frame.min_key());
                self.previous_max = Some(frame.max_key().clone());
                self.previous = Some(frame.with_bounds(Some(min), None));
                continue;
            };
            let mut last_max = self.previous_max.take().unwrap_or_default();
            if &last_max >= frame.min_key() {
                if let Some(max) = last.true_max()?.cloned() {
                    last_max = max;
                }
                let true_min = frame.true_min()?.cloned();
                frame = frame.with_bounds(true_min, None);
                if &last_max >= frame.min_key() {
                    return Err(FramedexError::out_of_order(format!(
                        "sorted frames out of order: {last_max} >= {}",
                        frame.min_key()
                    )));
                }
            }
            let this_max = frame.max_key().clone();
            let last_sep = between(&last_max, frame.min_key(), true)?;
            let this_min = between(&last_max, frame.min_key(), false)?;
            self.previous = Some(frame.with_bounds(Some(this_min), None));
            self.previous_max = Some(this_max);
            return Ok(Some(last.with_bounds(None, Some(last_sep))));
        }
    }
}

impl Iterator for TruncateKeyStats<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn frame_of(keys: &[i64], tag: &str) -> Frame {
        Frame::from_sorted(
            keys.iter()
                .map(|k| (Key::new([*k]), Value::from(format!("{tag}{k}"))))
                .collect(),
        )
    }

    fn keys_of(pairs: &[Pair]) -> Vec<i64> {
        pairs
            .iter()
            .map(|(k, _)| k.first().and_then(crate::types::Scalar::as_int).unwrap())
            .collect()
    }

    #[test]
    fn merge_prefers_requested_side() {
        let left = from_frames(vec![frame_of(&[1, 3, 5], "l"), frame_of(&[7, 9], "l")]);
        let right = from_frames(vec![frame_of(&[2, 3], "r"), frame_of(&[9, 10], "r")]);
        let pairs = collect_pairs(merge(left, right, true)).unwrap();
        assert_eq!(keys_of(&pairs), vec![1, 2, 3, 5, 7, 9, 10]);
        assert_eq!(pairs[2].1, Value::from("l3"));
        assert_eq!(pairs[5].1, Value::from("l9"));

        let left = from_frames(vec![frame_of(&[1, 3], "l")]);
        let right = from_frames(vec![frame_of(&[3], "r")]);
        let pairs = collect_pairs(merge(left, right, false)).unwrap();
        assert_eq!(pairs[1].1, Value::from("r3"));
    }

    #[test]
    fn disjoint_frames_pass_unexploded() {
        let raw = frame_of(&[1, 2], "a");
        let encoded = raw.encoded().unwrap().to_vec();
        let lazy = Frame::from_encoded(encoded, Key::new([1_i64]), Key::new([2_i64]), 2, None);
        let out: Vec<Frame> = merge(
            from_frames(vec![lazy]),
            from_frames(vec![frame_of(&[5], "b")]),
            true,
        )
        .collect::<Result<_>>()
        .unwrap();
        assert!(!out[0].is_exploded());
    }

    #[test]
    fn multi_merge_earliest_wins() {
        let streams = (0..5)
            .map(|i| from_frames(vec![frame_of(&[i, 10], &format!("s{i}"))]))
            .collect();
        let pairs = collect_pairs(multi_merge(streams, true)).unwrap();
        assert_eq!(keys_of(&pairs), vec![0, 1, 2, 3, 4, 10]);
        assert_eq!(pairs.last().unwrap().1, Value::from("s010"));
    }

    #[test]
    fn range_respects_exclusivity() {
        let source = || from_frames(vec![frame_of(&[1, 2, 3], "x"), frame_of(&[4, 5, 6], "x")]);
        let all = KeyRange {
            low: Some(Key::new([2_i64])),
            high: Some(Key::new([5_i64])),
            exclude_low: false,
            exclude_high: false,
        };
        assert_eq!(keys_of(&collect_pairs(range(source(), all)).unwrap()), vec![2, 3, 4, 5]);
        let open = KeyRange {
            low: Some(Key::new([2_i64])),
            high: Some(Key::new([5_i64])),
            exclude_low: true,
            exclude_high: true,
        };
        assert_eq!(keys_of(&collect_pairs(range(source(), open)).unwrap()), vec![3, 4]);
    }

    #[test]
    fn split_and_join_preserve_pairs() {
        let keys: Vec<i64> = (0..200).collect();
        let big = frame_of(&keys, "value-");
        let split: Vec<Frame> = split_too_large(from_frames(vec![big]), 200)
            .collect::<Result<_>>()
            .unwrap();
        assert!(split.len() > 5);
        let joined = collect_pairs(join_too_small_by_bytes(from_frames(split), 1000)).unwrap();
        assert_eq!(keys_of(&joined), keys);
    }

    #[test]
    fn tombstones_removed() {
        let frame = Frame::from_sorted(vec![
            (Key::new([1_i64]), Value::Int(1)),
            (Key::new([2_i64]), Value::Tombstone),
        ]);
        let pairs = collect_pairs(remove_tombstones(from_frames(vec![frame]), None, true)).unwrap();
        assert_eq!(keys_of(&pairs), vec![1]);

        let frame = Frame::from_sorted(vec![
            (Key::new([1_i64]), Value::Int(1)),
            (Key::new([2_i64]), Value::Tombstone),
        ]);
        let skipped = collect_pairs(remove_tombstones(
            from_frames(vec![frame]),
            Some(Key::new([1_i64])),
            false,
        ))
        .unwrap();
        assert!(skipped.is_empty());
    }

    #[test]
    fn truncated_stats_stay_valid() {
        let frames = vec![
            Frame::from_sorted(vec![(Key::new(["apple"]), Value::Unit)]),
            Frame::from_sorted(vec![(Key::new(["banana"]), Value::Unit)]),
            Frame::from_sorted(vec![(Key::new(["cherry"]), Value::Unit)]),
        ];
        let out: Vec<Frame> = truncate_key_stats(from_frames(frames))
            .collect::<Result<_>>()
            .unwrap();
        for frame in &out {
            let pairs = frame.pairs().unwrap();
            assert!(frame.min_key() <= &pairs[0].0);
            assert!(frame.max_key() >= &pairs.last().unwrap().0);
        }
        assert!(out[0].max_key() < &Key::new(["banana"]));
        assert!(out[1].min_key() > &Key::new(["apple"]));
        assert_eq!(out[2].max_key(), &Key::max());
    }

    #[test]
    fn out_of_order_detected() {
        let frames = vec![frame_of(&[5, 6], "a"), frame_of(&[1, 2], "b")];
        let result: Result<Vec<Frame>> = truncate_key_stats(from_frames(frames)).collect();
        assert!(matches!(result, Err(FramedexError::OutOfOrder { .. })));
    }
}
