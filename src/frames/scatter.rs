//! External sample-pivot scatter sort.
//!
//! Input batches arrive unordered and may repeat keys. A first pass samples
//! keys and measures volume; pivots chosen from the sample route every pair of
//! a second pass into a bucket chain. A chain keeps one in-memory head and a
//! linked stack of spilled segments in a shared scratch file. Output walks the
//! buckets in pivot order, collapsing short chains in memory and re-scattering
//! long ones with fresh pivots.
//!
//! Each chain records whether newer inserts overwrite older ones. Segments are
//! re-read newest first when a chain is re-scattered, so the flag flips at every
//! recursion level.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::codec;
use super::frame::{Frame, pair_size};
use super::stream::FrameStream;
use crate::constants::{HIBERNATE_CHAIN_LENGTH, MIN_SCATTER, SCRATCH_SUFFIX};
use crate::error::{FramedexError, Result};
use crate::io::naming;
use crate::types::{Key, Pair, SorterOptions, Value};

#[derive(Serialize, Deserialize)]
struct Segment {
    next: Option<u64>,
    pairs: Vec<Pair>,
}

/// Append-only scratch storage for spilled segments, deleted on drop.
struct Scratch {
    file: NamedTempFile,
    end: u64,
}

impl Scratch {
    fn create(dir: &Path) -> Result<Self> {
        let prefix = format!("m{}_", naming::timestamp());
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(SCRATCH_SUFFIX)
            .tempfile_in(dir)?;
        Ok(Self { file, end: 0 })
    }

    fn append(&mut self, segment: &Segment) -> Result<u64> {
        let bytes = codec::encode(segment)?;
        let at = self.end;
        let handle = self.file.as_file_mut();
        handle.seek(SeekFrom::Start(at))?;
        handle.write_all(&(bytes.len() as u64).to_le_bytes())?;
        handle.write_all(&bytes)?;
        self.end = at + 8 + bytes.len() as u64;
        Ok(at)
    }

    fn read(&mut self, at: u64) -> Result<Segment> {
        let handle = self.file.as_file_mut();
        handle.seek(SeekFrom::Start(at))?;
        let mut len = [0_u8; 8];
        handle.read_exact(&mut len)?;
        let len = usize::try_from(u64::from_le_bytes(len))
            .map_err(|_| scatter_error("segment length overflow"))?;
        let mut bytes = vec![0_u8; len];
        handle.read_exact(&mut bytes)?;
        codec::decode(&bytes)
    }
}

fn scatter_error(reason: impl Into<String>) -> FramedexError {
    FramedexError::Scatter {
        reason: reason.into(),
    }
}

type SharedScratch = Rc<RefCell<Scratch>>;

/// One bucket: in-memory head plus spilled segments, newest first.
struct Chain {
    head: BTreeMap<Key, Value>,
    head_bytes: usize,
    tail: Option<u64>,
    spilled: usize,
    newer_wins: bool,
}

impl Chain {
    fn new(newer_wins: bool) -> Self {
        Self {
            head: BTreeMap::new(),
            head_bytes: 0,
            tail: None,
            spilled: 0,
            newer_wins,
        }
    }

    fn len(&self) -> usize {
        self.spilled + usize::from(!self.head.is_empty())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, key: Key, value: Value, bytes: usize) {
        if self.newer_wins {
            self.head.insert(key, value);
        } else {
            self.head.entry(key).or_insert(value);
        }
        self.head_bytes += bytes;
    }

    fn spill(&mut self, scratch: &SharedScratch) -> Result<()> {
        if self.head.is_empty() {
            return Ok(());
        }
        let pairs: Vec<Pair> = std::mem::take(&mut self.head).into_iter().collect();
        let at = scratch.borrow_mut().append(&Segment {
            next: self.tail,
            pairs,
        })?;
        self.tail = Some(at);
        self.spilled += 1;
        self.head_bytes = 0;
        Ok(())
    }

    /// Visit segments from newest (the head) to oldest.
    fn visit_segments(
        &self,
        scratch: &SharedScratch,
        mut visit: impl FnMut(Vec<Pair>) -> Result<()>,
    ) -> Result<()> {
        if !self.head.is_empty() {
            visit(
                self.head
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )?;
        }
        let mut next = self.tail;
        while let Some(at) = next {
            let segment = scratch.borrow_mut().read(at)?;
            next = segment.next;
            visit(segment.pairs)?;
        }
        Ok(())
    }

    /// Merge every segment into one sorted map honoring the priority flag.
    fn collapse(self, scratch: &SharedScratch) -> Result<Vec<Pair>> {
        let mut merged = self.head;
        let mut next = self.tail;
        while let Some(at) = next {
            let segment = scratch.borrow_mut().read(at)?;
            next = segment.next;
            for (key, value) in segment.pairs {
                if self.newer_wins {
                    merged.entry(key).or_insert(value);
                } else {
                    merged.insert(key, value);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

/// Scatter sorter over unordered dictionaries.
pub struct ScatterSorter {
    options: SorterOptions,
    scratch: SharedScratch,
    younger_to_right: bool,
    rng: Pcg64,
    samples: Vec<Key>,
    seen: u64,
    total_bytes: u64,
    pivots: Option<Vec<Key>>,
    buckets: Vec<Chain>,
    fed_chains: bool,
    fed_dictionaries: bool,
}

impl ScatterSorter {
    /// New sorter with its scratch file in `scratch_dir`.
    ///
    /// With `younger_to_right`, a key inserted later replaces an earlier value.
    pub fn new(scratch_dir: &Path, options: SorterOptions, younger_to_right: bool) -> Result<Self> {
        let scratch = Rc::new(RefCell::new(Scratch::create(scratch_dir)?));
        Ok(Self::with_scratch(scratch, options, younger_to_right))
    }

    fn with_scratch(scratch: SharedScratch, options: SorterOptions, younger_to_right: bool) -> Self {
        let rng = match options.seed {
            Some(seed) => Pcg64::seed_from_u64(seed),
            None => Pcg64::from_entropy(),
        };
        Self {
            options,
            scratch,
            younger_to_right,
            rng,
            samples: Vec::new(),
            seen: 0,
            total_bytes: 0,
            pivots: None,
            buckets: Vec::new(),
            fed_chains: false,
            fed_dictionaries: false,
        }
    }

    fn sample_capacity(&self) -> usize {
        (self.options.max_scatter * self.options.over_sample).max(1)
    }

    /// First pass: account bytes and reservoir-sample keys.
    pub fn analyze<'p>(&mut self, pairs: impl IntoIterator<Item = &'p Pair>) -> Result<()> {
        if self.pivots.is_some() {
            return Err(scatter_error("analysis after scattering started"));
        }
        let capacity = self.sample_capacity();
        for pair in pairs {
            self.total_bytes += pair_size(pair)? as u64;
            self.seen += 1;
            if self.samples.len() < capacity {
                self.samples.push(pair.0.clone());
            } else {
                let slot = self.rng.gen_range(0..self.seen);
                if let Ok(slot) = usize::try_from(slot) {
                    if slot < capacity {
                        self.samples[slot] = pair.0.clone();
                    }
                }
            }
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn scatter_width(&self) -> usize {
        let by_volume = (self.total_bytes / self.options.bucket_bytes.max(1) as u64)
            .saturating_mul(4)
            .max(MIN_SCATTER as u64);
        usize::try_from(by_volume)
            .unwrap_or(usize::MAX)
            .min(self.options.max_scatter.max(1))
    }

    fn ensure_pivots(&mut self, newer_wins: bool) {
        if self.pivots.is_some() {
            return;
        }
        let mut sample = std::mem::take(&mut self.samples);
        sample.sort();
        sample.dedup();
        let width = self.scatter_width();
        let mut pivots = Vec::new();
        if !sample.is_empty() && width > 1 {
            for j in 1..width {
                let pivot = &sample[j * sample.len() / width];
                if pivots.last() != Some(pivot) {
                    pivots.push(pivot.clone());
                }
            }
        }
        self.buckets = (0..=pivots.len()).map(|_| Chain::new(newer_wins)).collect();
        tracing::debug!(
            pivots = pivots.len(),
            total_bytes = self.total_bytes,
            "scatter pivots chosen"
        );
        self.pivots = Some(pivots);
    }

    fn route(&mut self, pairs: Vec<Pair>) -> Result<()> {
        let pivots = self.pivots.as_deref().unwrap_or_default();
        let mut touched = Vec::new();
        for pair in pairs {
            let bytes = pair_size(&pair)?;
            let (key, value) = pair;
            let slot = pivots.partition_point(|p| p <= &key);
            self.buckets[slot].insert(key, value, bytes);
            touched.push(slot);
        }
        touched.sort_unstable();
        touched.dedup();
        for slot in touched {
            if self.buckets[slot].head_bytes > self.options.bucket_bytes {
                self.buckets[slot].spill(&self.scratch)?;
            }
        }
        if self
            .buckets
            .iter()
            .any(|chain| chain.spilled > HIBERNATE_CHAIN_LENGTH)
        {
            for chain in &mut self.buckets {
                chain.spill(&self.scratch)?;
            }
        }
        Ok(())
    }

    /// Second pass: route one dictionary into the buckets.
    pub fn scatter_dictionary(&mut self, pairs: impl IntoIterator<Item = Pair>) -> Result<()> {
        if self.fed_chains {
            return Err(scatter_error("cannot mix dictionaries with chains"));
        }
        self.fed_dictionaries = true;
        self.ensure_pivots(self.younger_to_right);
        self.route(pairs.into_iter().collect())
    }

    /// Re-scatter a chain. Its segments arrive newest first, so the buckets
    /// get the inverted priority flag.
    fn scatter_chain(&mut self, chain: &Chain) -> Result<()> {
        if self.fed_dictionaries {
            return Err(scatter_error("cannot mix chains with dictionaries"));
        }
        self.fed_chains = true;
        let scratch = Rc::clone(&self.scratch);
        chain.visit_segments(&scratch, |segment| self.analyze(&segment))?;
        self.ensure_pivots(!chain.newer_wins);
        chain.visit_segments(&scratch, |segment| self.route(segment))
    }

    /// Lazily emit the sorted, de-duplicated content as frames.
    pub fn into_frames(mut self) -> FrameStream<'static> {
        self.ensure_pivots(self.younger_to_right);
        let stack = std::mem::take(&mut self.buckets)
            .into_iter()
            .rev()
            .map(|chain| (chain, 0))
            .collect();
        Box::new(ScatterFrames {
            scratch: Rc::clone(&self.scratch),
            options: self.options,
            stack,
        })
    }
}

struct ScatterFrames {
    scratch: SharedScratch,
    options: SorterOptions,
    stack: Vec<(Chain, usize)>,
}

impl ScatterFrames {
    fn step(&mut self) -> Result<Option<Frame>> {
        while let Some((chain, depth)) = self.stack.pop() {
            if chain.is_empty() {
                continue;
            }
            if chain.len() < self.options.recursion_minimum || depth >= self.options.max_depth {
                return Ok(Some(Frame::from_sorted(chain.collapse(&self.scratch)?)));
            }
            let mut sub = ScatterSorter::with_scratch(
                Rc::clone(&self.scratch),
                self.options,
                !chain.newer_wins,
            );
            sub.scatter_chain(&chain)?;
            let nonempty = sub.buckets.iter().filter(|c| !c.is_empty()).count();
            if nonempty <= 1 {
                // No progress: the sample could not separate the chain.
                return Ok(Some(Frame::from_sorted(chain.collapse(&self.scratch)?)));
            }
            tracing::debug!(depth, buckets = nonempty, "re-scattering long chain");
            self.stack
                .extend(sub.buckets.into_iter().rev().map(|c| (c, depth + 1)));
        }
        Ok(None)
    }
}

impl Iterator for ScatterFrames {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::stream::collect_pairs;
    use tempfile::TempDir;

    fn tiny_options() -> SorterOptions {
        SorterOptions {
            bucket_bytes: 200,
            max_scatter: 5,
            over_sample: 3,
            recursion_minimum: 2,
            max_depth: 6,
            seed: Some(11),
        }
    }

    fn batches(rng: &mut fastrand::Rng) -> Vec<Vec<Pair>> {
        (0..20)
            .map(|b| {
                (0..60)
                    .map(|_| {
                        let k = rng.u32(0..400);
                        (Key::new([format!("key{k:04}")]), Value::Int(b))
                    })
                    .collect()
            })
            .collect()
    }

    fn sort_with(younger_to_right: bool) -> (Vec<Pair>, BTreeMap<Key, Value>) {
        let dir = TempDir::new().unwrap();
        let mut rng = fastrand::Rng::with_seed(3);
        let input = batches(&mut rng);
        let mut sorter = ScatterSorter::new(dir.path(), tiny_options(), younger_to_right).unwrap();
        for batch in &input {
            sorter.analyze(batch).unwrap();
        }
        for batch in &input {
            sorter.scatter_dictionary(batch.clone()).unwrap();
        }
        let output = collect_pairs(sorter.into_frames()).unwrap();

        let mut expected = BTreeMap::new();
        for batch in &input {
            for (k, v) in batch {
                if younger_to_right {
                    expected.insert(k.clone(), v.clone());
                } else {
                    expected.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        (output, expected)
    }

    #[test]
    fn output_is_sorted_unique_and_younger_wins() {
        let (output, expected) = sort_with(true);
        let expected: Vec<Pair> = expected.into_iter().collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn older_wins_when_requested() {
        let (output, expected) = sort_with(false);
        let expected: Vec<Pair> = expected.into_iter().collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let sorter = ScatterSorter::new(dir.path(), tiny_options(), true).unwrap();
        assert!(collect_pairs(sorter.into_frames()).unwrap().is_empty());
    }

    #[test]
    fn scratch_file_is_named_and_removed() {
        let dir = TempDir::new().unwrap();
        {
            let mut sorter = ScatterSorter::new(dir.path(), tiny_options(), true).unwrap();
            let batch: Vec<Pair> = (0..100)
                .map(|i| (Key::new([i as i64]), Value::Unit))
                .collect();
            sorter.analyze(&batch).unwrap();
            sorter.scatter_dictionary(batch).unwrap();
            let names: Vec<String> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            assert!(names.iter().any(|n| n.starts_with('m') && n.ends_with(".merge")));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
