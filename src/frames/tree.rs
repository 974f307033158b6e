//! Immutable, file-backed sorted trees.
//!
//! Layout: leaf records first, then each index level, each level closed by a
//! `$` byte. Every record is
//!
//! ```text
//! \n %08d&%08d (count, payload length) | bincode (min, max) | bincode pairs
//! ```
//!
//! and the file ends with the trailer `\n?{root_seek}&{height}`. Interior
//! records map a child's (estimated) max key to the child's record offset.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use memmap2::Mmap;

use super::codec;
use super::frame::Frame;
use super::stream::{self, FrameStream};
use crate::constants::{
    LEVEL_SENTINEL, MAX_RECORD_FIELD, MAX_TREE_HEIGHT, RECORD_PREFIX_LEN, TRAILER_MARKER,
    TRAILER_SCAN_BYTES,
};
use crate::error::{FramedexError, Result};
use crate::types::{Key, Pair, TreeOptions, Value};

/// Stats kept per written record while building the next level.
struct RecordStat {
    min: Key,
    max: Key,
    seek: u64,
}

struct TreeWriter<W: Write> {
    out: W,
    offset: u64,
    path: PathBuf,
}

/// The fixed-width `count&length` prefix of a record, or `None` when either
/// field does not fit in its eight digits.
fn record_prefix(count: usize, payload_len: usize) -> Option<String> {
    (count <= MAX_RECORD_FIELD && payload_len <= MAX_RECORD_FIELD)
        .then(|| format!("\n{count:08}&{payload_len:08}"))
}

impl<W: Write> TreeWriter<W> {
    fn write_record(&mut self, frame: &Frame) -> Result<RecordStat> {
        let seek = self.offset;
        let payload = frame.encoded()?;
        let bounds = codec::encode(&(frame.min_key(), frame.max_key()))?;
        let prefix = record_prefix(frame.len(), payload.len()).ok_or_else(|| {
            FramedexError::corrupt(
                &self.path,
                format!(
                    "record of {} pairs and {} bytes exceeds the prefix width",
                    frame.len(),
                    payload.len()
                ),
            )
        })?;
        self.out.write_all(prefix.as_bytes())?;
        self.out.write_all(&bounds)?;
        self.out.write_all(payload)?;
        self.offset += (prefix.len() + bounds.len() + payload.len()) as u64;
        Ok(RecordStat {
            min: frame.min_key().clone(),
            max: frame.max_key().clone(),
            seek,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

/// Group one level's records into interior nodes.
fn interior_nodes(children: &[RecordStat], node_bytes: usize) -> Result<Vec<Frame>> {
    let mut nodes = Vec::new();
    let mut pairs: Vec<Pair> = Vec::new();
    let mut first_min: Option<Key> = None;
    let mut size = 0;
    for child in children {
        first_min.get_or_insert_with(|| child.min.clone());
        size += codec::encode(&child.max)?.len() + 8;
        pairs.push((child.max.clone(), Value::Int(child.seek as i64)));
        if size > node_bytes && pairs.len() > 1 {
            let max = child.max.clone();
            nodes.push(Frame::from_sorted(std::mem::take(&mut pairs)).with_bounds(first_min.take(), Some(max)));
            size = 0;
        }
    }
    if let Some(last) = children.last().filter(|_| !pairs.is_empty()) {
        nodes.push(Frame::from_sorted(pairs).with_bounds(first_min, Some(last.max.clone())));
    }
    Ok(nodes)
}

#[derive(Default)]
struct NodeCache {
    nodes: HashMap<u64, Rc<Frame>>,
    order: VecDeque<u64>,
}

/// A read-only sorted tree backed by a memory map.
pub struct SortedTree {
    path: PathBuf,
    map: Mmap,
    root_seek: Option<u64>,
    height: usize,
    cache: RefCell<NodeCache>,
    cache_limit: usize,
}

impl std::fmt::Debug for SortedTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedTree")
            .field("path", &self.path)
            .field("root_seek", &self.root_seek)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl SortedTree {
    /// Write a new tree from an ascending frame stream and open it.
    pub fn create(path: &Path, frames: FrameStream<'_>, options: &TreeOptions) -> Result<Self> {
        let node_bytes = options.node_bytes.max(1);
        let file = fs_err::File::create(path)?;
        let mut writer = TreeWriter {
            out: BufWriter::new(file),
            offset: 0,
            path: path.to_path_buf(),
        };
        let leaves = stream::truncate_key_stats(stream::adjust_sizes(frames, node_bytes * 2, node_bytes));
        let mut level = Vec::new();
        for frame in leaves {
            let frame = frame?;
            if frame.is_empty() {
                continue;
            }
            level.push(writer.write_record(&frame)?);
        }
        writer.write_raw(&[LEVEL_SENTINEL])?;
        let mut height = 0_usize;
        while level.len() > 1 {
            let nodes = interior_nodes(&level, node_bytes)?;
            if nodes.len() >= level.len() {
                return Err(FramedexError::out_of_order(format!(
                    "index level of {} nodes did not shrink",
                    level.len()
                )));
            }
            level = nodes
                .iter()
                .map(|node| writer.write_record(node))
                .collect::<Result<_>>()?;
            writer.write_raw(&[LEVEL_SENTINEL])?;
            height += 1;
        }
        let root = level.first().map_or(-1, |stat| stat.seek as i64);
        writer.write_raw(format!("\n?{root}&{height}").as_bytes())?;
        let file = writer
            .out
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;
        file.sync_all()?;
        drop(file);
        tracing::debug!(path = %path.display(), height, "sorted tree written");
        Self::open(path, options)
    }

    /// Write a tree holding no pairs.
    pub fn create_empty(path: &Path, options: &TreeOptions) -> Result<Self> {
        Self::create(path, stream::empty(), options)
    }

    pub fn open(path: &Path, options: &TreeOptions) -> Result<Self> {
        let file = fs_err::File::open(path)?;
        // Safety: tree files are never modified after they are written.
        let map = unsafe { Mmap::map(file.file())? };
        let (root_seek, height) = read_trailer(path, &map)?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            root_seek,
            height,
            cache: RefCell::new(NodeCache::default()),
            cache_limit: options.cache_limit.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.root_seek.is_none()
    }

    /// Decode the record at `seek`; returns the frame and the offset after it.
    fn read_record(&self, seek: u64) -> Result<(Frame, u64)> {
        let bytes = &self.map[..];
        let start = usize::try_from(seek).map_err(|_| self.corrupt(seek, "seek overflow"))?;
        let header_end = start + 1 + RECORD_PREFIX_LEN;
        if bytes.get(start) != Some(&b'\n') || header_end > bytes.len() {
            return Err(self.corrupt(seek, "missing record start"));
        }
        let prefix = std::str::from_utf8(&bytes[start + 1..header_end])
            .map_err(|_| self.corrupt(seek, "record prefix not ascii"))?;
        let (count, payload_len) = prefix
            .split_once('&')
            .and_then(|(c, l)| Some((c.parse::<usize>().ok()?, l.parse::<usize>().ok()?)))
            .ok_or_else(|| self.corrupt(seek, "unparseable record prefix"))?;
        let ((min, max), used): ((Key, Key), usize) = codec::decode_prefix(&bytes[header_end..])?;
        let payload_start = header_end + used;
        let payload_end = payload_start + payload_len;
        let payload = bytes
            .get(payload_start..payload_end)
            .ok_or_else(|| self.corrupt(seek, "payload truncated"))?;
        let frame = Frame::from_encoded(payload.to_vec(), min, max, count, Some(seek));
        Ok((frame, payload_end as u64))
    }

    fn corrupt(&self, seek: u64, reason: &str) -> FramedexError {
        FramedexError::corrupt(&self.path, format!("{reason} at offset {seek}"))
    }

    fn node(&self, seek: u64) -> Result<Rc<Frame>> {
        if let Some(node) = self.cache.borrow().nodes.get(&seek) {
            return Ok(Rc::clone(node));
        }
        let (frame, _) = self.read_record(seek)?;
        let node = Rc::new(frame);
        let mut cache = self.cache.borrow_mut();
        cache.nodes.insert(seek, Rc::clone(&node));
        cache.order.push_back(seek);
        while cache.order.len() > self.cache_limit {
            if let Some(evicted) = cache.order.pop_front() {
                cache.nodes.remove(&evicted);
            }
        }
        Ok(node)
    }

    fn child_seek(&self, pair: &Pair) -> Result<u64> {
        pair.1
            .as_int()
            .and_then(|seek| u64::try_from(seek).ok())
            .ok_or_else(|| FramedexError::corrupt(&self.path, "interior value is not an offset"))
    }

    /// Offset of the first leaf that could hold keys `>= key`.
    fn find_leaf(&self, key: &Key) -> Result<Option<u64>> {
        let Some(mut seek) = self.root_seek else {
            return Ok(None);
        };
        for _ in 0..self.height {
            let node = self.node(seek)?;
            let Some(pair) = node.at_or_next(key)? else {
                return Ok(None);
            };
            seek = self.child_seek(pair)?;
        }
        Ok(Some(seek))
    }

    fn last_leaf(&self) -> Result<Option<u64>> {
        let Some(mut seek) = self.root_seek else {
            return Ok(None);
        };
        for _ in 0..self.height {
            let node = self.node(seek)?;
            let Some(pair) = node.pairs()?.last() else {
                return Err(FramedexError::corrupt(&self.path, "empty interior node"));
            };
            seek = self.child_seek(pair)?;
        }
        Ok(Some(seek))
    }

    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        let Some(seek) = self.find_leaf(key)? else {
            return Ok(None);
        };
        let leaf = if self.height == 0 {
            self.node(seek)?
        } else {
            Rc::new(self.read_record(seek)?.0)
        };
        Ok(leaf.get(key)?.cloned())
    }

    pub fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Leaf frames from the one holding `from` (or the first) to the end.
    ///
    /// Frames may start before `from`. Unless `inclusive`, a first leaf whose
    /// last key is `<= from` is skipped.
    pub fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>> {
        let start = match from {
            None => self.root_seek.map(|_| 0),
            Some(key) => self.find_leaf(key)?,
        };
        let Some(start) = start else {
            return Ok(stream::empty());
        };
        let records: FrameStream<'_> = Box::new(LeafRecords {
            tree: self,
            next_seek: Some(start),
        });
        Ok(match from {
            Some(key) if !inclusive => stream::skip_leading_upto(records, key.clone()),
            _ => records,
        })
    }

    /// Monotone position estimate of `key`: leaf offset plus in-leaf position.
    pub fn index_of(&self, key: &Key) -> Result<u64> {
        match self.find_leaf(key)? {
            None => self.last_index(),
            Some(seek) => {
                let (leaf, _) = self.read_record(seek)?;
                Ok(seek + leaf.index_of(key)? as u64)
            }
        }
    }

    pub fn last_index(&self) -> Result<u64> {
        match self.last_leaf()? {
            None => Ok(0),
            Some(seek) => {
                let (leaf, _) = self.read_record(seek)?;
                Ok(seek + leaf.len() as u64)
            }
        }
    }

    pub fn first_pair(&self) -> Result<Option<Pair>> {
        self.at_or_next_pair(&Key::default(), false)
    }

    /// First pair with key `>= key` (or `> key` when `force_next`).
    pub fn at_or_next_pair(&self, key: &Key, force_next: bool) -> Result<Option<Pair>> {
        for frame in self.leaf_frames(Some(key), true)? {
            let frame = frame?;
            let pairs = frame.pairs()?;
            let idx = if force_next {
                pairs.partition_point(|(k, _)| k <= key)
            } else {
                pairs.partition_point(|(k, _)| k < key)
            };
            if let Some(pair) = pairs.get(idx) {
                return Ok(Some(pair.clone()));
            }
        }
        Ok(None)
    }

    pub fn next_pair_after(&self, key: &Key) -> Result<Option<Pair>> {
        self.at_or_next_pair(key, true)
    }

    /// Every pair in ascending order.
    pub fn scan(&self) -> Result<Vec<Pair>> {
        stream::collect_pairs(self.leaf_frames(None, true)?)
    }
}

struct LeafRecords<'a> {
    tree: &'a SortedTree,
    next_seek: Option<u64>,
}

impl LeafRecords<'_> {
    fn step(&mut self) -> Result<Option<Frame>> {
        let Some(seek) = self.next_seek else {
            return Ok(None);
        };
        let (frame, after) = self.tree.read_record(seek)?;
        let after_idx = usize::try_from(after).unwrap_or(usize::MAX);
        self.next_seek = match self.tree.map.get(after_idx) {
            Some(&b'\n') => Some(after),
            Some(&LEVEL_SENTINEL) => None,
            _ => return Err(self.tree.corrupt(after, "leaf level not terminated")),
        };
        Ok(Some(frame))
    }
}

impl Iterator for LeafRecords<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

fn read_trailer(path: &Path, bytes: &[u8]) -> Result<(Option<u64>, usize)> {
    let invalid = |reason: &str| FramedexError::InvalidTrailer {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };
    let window_start = bytes.len().saturating_sub(TRAILER_SCAN_BYTES);
    let marker = memchr::memrchr(TRAILER_MARKER, &bytes[window_start..])
        .ok_or_else(|| invalid("trailer marker not found"))?;
    let text = std::str::from_utf8(&bytes[window_start + marker + 1..])
        .map_err(|_| invalid("trailer not ascii"))?;
    let (root, height) = text
        .trim()
        .split_once('&')
        .ok_or_else(|| invalid("trailer missing separator"))?;
    let root: i64 = root.parse().map_err(|_| invalid("bad root offset"))?;
    let height: i64 = height.parse().map_err(|_| invalid("bad height"))?;
    if !(0..=MAX_TREE_HEIGHT).contains(&height) {
        return Err(invalid("height out of range"));
    }
    let root = match root {
        -1 => None,
        r if r >= 0 && (r as u64) < bytes.len() as u64 => Some(r as u64),
        _ => return Err(invalid("root offset outside file")),
    };
    Ok((root, height as usize))
}

/// Build a new tree at `path` from `older` overlaid by `newer`.
pub fn merge_trees(
    older: &SortedTree,
    newer: &SortedTree,
    path: &Path,
    drop_tombstones: bool,
    options: &TreeOptions,
) -> Result<SortedTree> {
    let merged = stream::merge(
        newer.leaf_frames(None, true)?,
        older.leaf_frames(None, true)?,
        true,
    );
    let merged = if drop_tombstones {
        stream::remove_tombstones(merged, None, true)
    } else {
        merged
    };
    SortedTree::create(path, merged, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_prefix_has_fixed_width() {
        let prefix = record_prefix(12, MAX_RECORD_FIELD).unwrap();
        assert_eq!(prefix.len(), 1 + RECORD_PREFIX_LEN);
        assert_eq!(prefix, "\n00000012&99999999");
        assert!(record_prefix(MAX_RECORD_FIELD + 1, 10).is_none());
        assert!(record_prefix(10, MAX_RECORD_FIELD + 1).is_none());
    }

    fn small_opts() -> TreeOptions {
        TreeOptions {
            node_bytes: 128,
            cache_limit: 4,
        }
    }

    fn pairs(n: i64, tag: &str) -> Vec<Pair> {
        (0..n)
            .map(|i| (Key::new([format!("k{i:05}")]), Value::from(format!("{tag}{i}"))))
            .collect()
    }

    #[test]
    fn round_trip_multi_level() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.ktree");
        let input = pairs(2000, "v");
        let tree = SortedTree::create(
            &path,
            stream::from_sorted_pairs(input.clone(), 300),
            &small_opts(),
        )
        .unwrap();
        assert!(tree.height() >= 2);
        drop(tree);
        let tree = SortedTree::open(&path, &small_opts()).unwrap();
        assert_eq!(tree.scan().unwrap(), input);
        assert_eq!(
            tree.get(&Key::new(["k01234"])).unwrap(),
            Some(Value::from("v1234"))
        );
        assert_eq!(tree.get(&Key::new(["k01234x"])).unwrap(), None);
        assert_eq!(tree.get(&Key::new(["zzz"])).unwrap(), None);
    }

    #[test]
    fn empty_tree_has_no_root() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e.ktree");
        let tree = SortedTree::create_empty(&path, &small_opts()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.last_index().unwrap(), 0);
        assert!(tree.scan().unwrap().is_empty());
        assert_eq!(tree.first_pair().unwrap(), None);
    }

    #[test]
    fn index_positions_are_monotone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("i.ktree");
        let tree = SortedTree::create(
            &path,
            stream::from_sorted_pairs(pairs(500, "v"), 200),
            &small_opts(),
        )
        .unwrap();
        let mut last = 0;
        for i in (0..500).step_by(37) {
            let at = tree.index_of(&Key::new([format!("k{i:05}")])).unwrap();
            assert!(at >= last);
            last = at;
        }
        assert!(tree.last_index().unwrap() >= last);
        assert_eq!(tree.index_of(&Key::new(["zzz"])).unwrap(), tree.last_index().unwrap());
    }

    #[test]
    fn navigation_helpers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n.ktree");
        let tree = SortedTree::create(
            &path,
            stream::from_sorted_pairs(pairs(300, "v"), 100),
            &small_opts(),
        )
        .unwrap();
        assert_eq!(tree.first_pair().unwrap().unwrap().0, Key::new(["k00000"]));
        let after = tree.next_pair_after(&Key::new(["k00150"])).unwrap().unwrap();
        assert_eq!(after.0, Key::new(["k00151"]));
        let at = tree.at_or_next_pair(&Key::new(["k00150"]), false).unwrap().unwrap();
        assert_eq!(at.0, Key::new(["k00150"]));
        assert_eq!(tree.next_pair_after(&Key::new(["k00299"])).unwrap(), None);
    }

    #[test]
    fn merge_prefers_newer_and_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let older = SortedTree::create(
            &dir.path().join("a.ktree"),
            stream::from_sorted_pairs(pairs(100, "old"), 100),
            &small_opts(),
        )
        .unwrap();
        let newer_pairs = vec![
            (Key::new(["k00010"]), Value::from("new")),
            (Key::new(["k00011"]), Value::Tombstone),
            (Key::new(["k99999"]), Value::from("extra")),
        ];
        let newer = SortedTree::create(
            &dir.path().join("b.ktree"),
            stream::from_sorted_pairs(newer_pairs, 100),
            &small_opts(),
        )
        .unwrap();
        let merged =
            merge_trees(&older, &newer, &dir.path().join("c.ktree"), true, &small_opts()).unwrap();
        let all = merged.scan().unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(merged.get(&Key::new(["k00010"])).unwrap(), Some(Value::from("new")));
        assert_eq!(merged.get(&Key::new(["k00011"])).unwrap(), None);
        assert!(merged.has(&Key::new(["k99999"])).unwrap());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ktree");
        std::fs::write(&path, b"\n00000001&00000003garbage").unwrap();
        assert!(matches!(
            SortedTree::open(&path, &small_opts()),
            Err(FramedexError::InvalidTrailer { .. })
        ));
    }
}
