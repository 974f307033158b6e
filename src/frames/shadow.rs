//! Copy-on-write layering: a white layer shadowing a read-only grey source.
//!
//! A tombstone in the white layer masks whatever grey holds for that key.
//! Stacks are built by using one shadow tree as the grey of another.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;

use super::codec;
use super::frame::Frame;
use super::stream::{self, FrameStream, KeyRange};
use super::tree::SortedTree;
use crate::constants::DEFAULT_NODE_BYTES;
use crate::error::{FramedexError, Result};
use crate::types::{Key, Pair, Value};

/// Anything that can serve sorted frames and point lookups.
pub trait FrameSource {
    /// Stored value, which may be a tombstone.
    fn get(&self, key: &Key) -> Result<Option<Value>>;

    /// Frames covering keys from `from` onward (they may start earlier).
    /// Unless `inclusive`, a first frame with no key after `from` is skipped.
    fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>>;

    /// Monotone position estimate used to size key ranges.
    fn index_of(&self, key: &Key) -> Result<u64>;

    fn last_index(&self) -> Result<u64>;
}

impl FrameSource for SortedTree {
    fn get(&self, key: &Key) -> Result<Option<Value>> {
        SortedTree::get(self, key)
    }

    fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>> {
        SortedTree::leaf_frames(self, from, inclusive)
    }

    fn index_of(&self, key: &Key) -> Result<u64> {
        SortedTree::index_of(self, key)
    }

    fn last_index(&self) -> Result<u64> {
        SortedTree::last_index(self)
    }
}

/// A small in-memory sorted map, optionally persisted as a `.tiny` file.
#[derive(Debug, Default)]
pub struct TinyBuffer {
    pairs: BTreeMap<Key, Value>,
    path: Option<PathBuf>,
    read_only: bool,
    dirty: bool,
}

impl TinyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer that refuses writes.
    pub fn read_only_empty() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Load `path` if it exists; writes go back to the same path on `sync`.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let pairs = if path.exists() {
            load_pairs(path)?.into_iter().collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            pairs,
            path: Some(path.to_path_buf()),
            read_only,
            dirty: false,
        })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = Pair>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        if self.read_only {
            return Err(FramedexError::ReadOnly);
        }
        self.pairs.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    /// Overlay `other`'s pairs on this buffer (later wins).
    pub fn absorb(&mut self, other: impl IntoIterator<Item = Pair>) {
        self.pairs.extend(other);
    }

    pub fn lookup(&self, key: &Key) -> Option<&Value> {
        self.pairs.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.pairs.iter()
    }

    pub fn into_pairs(self) -> Vec<Pair> {
        self.pairs.into_iter().collect()
    }

    /// Write to the backing path when modified.
    pub fn sync(&mut self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        write_pairs(path, self.pairs.iter())?;
        self.dirty = false;
        Ok(())
    }
}

/// Read the pairs of a `.tiny` file.
pub fn load_pairs(path: &Path) -> Result<Vec<Pair>> {
    let bytes = fs_err::read(path)?;
    codec::decode(&bytes).map_err(|err| FramedexError::corrupt(path, err.to_string()))
}

/// Atomically replace `path` with the given ascending pairs.
pub fn write_pairs<'a>(path: &Path, pairs: impl Iterator<Item = (&'a Key, &'a Value)>) -> Result<()> {
    let pairs: Vec<(&Key, &Value)> = pairs.collect();
    let bytes = codec::encode(&pairs)?;
    let mut file = AtomicWriteFile::options().open(path)?;
    file.write_all(&bytes)?;
    file.commit()?;
    Ok(())
}

impl FrameSource for TinyBuffer {
    fn get(&self, key: &Key) -> Result<Option<Value>> {
        Ok(self.pairs.get(key).cloned())
    }

    fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>> {
        let lower = from.map_or(Bound::Unbounded, |key| Bound::Included(key.clone()));
        let pairs = self
            .pairs
            .range((lower, Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone()));
        let frames = stream::from_sorted_pairs(pairs, DEFAULT_NODE_BYTES);
        Ok(match from {
            Some(key) if !inclusive => stream::skip_leading_upto(frames, key.clone()),
            _ => frames,
        })
    }

    fn index_of(&self, key: &Key) -> Result<u64> {
        Ok(self.pairs.range(..key.clone()).count() as u64)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.pairs.len() as u64)
    }
}

/// A white layer: a writable buffer or a read-only tree.
#[derive(Debug)]
pub enum Layer {
    Tree(SortedTree),
    Buffer(TinyBuffer),
}

impl Layer {
    fn source(&self) -> &dyn FrameSource {
        match self {
            Self::Tree(tree) => tree,
            Self::Buffer(buffer) => buffer,
        }
    }

    pub fn as_buffer(&self) -> Option<&TinyBuffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            Self::Tree(_) => None,
        }
    }
}

impl FrameSource for Layer {
    fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.source().get(key)
    }

    fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>> {
        self.source().leaf_frames(from, inclusive)
    }

    fn index_of(&self, key: &Key) -> Result<u64> {
        self.source().index_of(key)
    }

    fn last_index(&self) -> Result<u64> {
        self.source().last_index()
    }
}

/// An empty read-only source, used as the bottom of a stack.
#[derive(Debug, Default)]
pub struct EmptySource;

impl FrameSource for EmptySource {
    fn get(&self, _key: &Key) -> Result<Option<Value>> {
        Ok(None)
    }

    fn leaf_frames(&self, _from: Option<&Key>, _inclusive: bool) -> Result<FrameStream<'_>> {
        Ok(stream::empty())
    }

    fn index_of(&self, _key: &Key) -> Result<u64> {
        Ok(0)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(0)
    }
}

/// White layer over grey source.
pub struct ShadowTree {
    white: Layer,
    grey: Box<dyn FrameSource>,
    caching: bool,
    last_frame: RefCell<Option<Frame>>,
}

impl std::fmt::Debug for ShadowTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowTree")
            .field("white", &self.white)
            .field("caching", &self.caching)
            .finish_non_exhaustive()
    }
}

impl ShadowTree {
    pub fn new(white: Layer, grey: Box<dyn FrameSource>) -> Self {
        Self {
            white,
            grey,
            caching: false,
            last_frame: RefCell::new(None),
        }
    }

    /// Keep the most recently produced frame for nearby lookups.
    #[must_use]
    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn white(&self) -> &Layer {
        &self.white
    }

    fn buffer_mut(&mut self) -> Result<&mut TinyBuffer> {
        self.last_frame.borrow_mut().take();
        match &mut self.white {
            Layer::Buffer(buffer) => Ok(buffer),
            Layer::Tree(_) => Err(FramedexError::ReadOnly),
        }
    }

    /// Visible value: white wins, a white tombstone hides grey.
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        match self.white.get(key)? {
            Some(Value::Tombstone) => Ok(None),
            Some(value) => Ok(Some(value)),
            None => Ok(self.grey.get(key)?.filter(|v| !v.is_tombstone())),
        }
    }

    pub fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        if value.is_tombstone() {
            return Err(FramedexError::TombstoneWrite {
                key: key.to_string(),
            });
        }
        self.buffer_mut()?.put(key, value)
    }

    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.buffer_mut()?.put(key, Value::Tombstone)
    }

    /// Persist the white buffer.
    pub fn finalize(&mut self) -> Result<()> {
        match &mut self.white {
            Layer::Buffer(buffer) => buffer.sync(),
            Layer::Tree(_) => Ok(()),
        }
    }

    /// Merged frames. Tombstones survive only with `keep_tombstones`.
    pub fn frames(
        &self,
        from: Option<&Key>,
        inclusive: bool,
        keep_tombstones: bool,
    ) -> Result<FrameStream<'_>> {
        let merged = stream::merge(
            self.white.leaf_frames(from, inclusive)?,
            self.grey.leaf_frames(from, inclusive)?,
            true,
        );
        if keep_tombstones {
            Ok(merged)
        } else {
            Ok(stream::remove_tombstones(merged, from.cloned(), inclusive))
        }
    }

    /// Visible pairs within `bounds`.
    pub fn scan(&self, bounds: KeyRange) -> Result<FrameStream<'_>> {
        let from = bounds.low.clone();
        Ok(stream::range(self.frames(from.as_ref(), true, false)?, bounds))
    }

    /// Visible pairs with `low <= key <= high`.
    pub fn range_pairs(&self, low: &Key, high: &Key) -> Result<Vec<Pair>> {
        stream::collect_pairs(self.scan(KeyRange::between(low.clone(), high.clone()))?)
    }

    fn cached_answer(&self, key: &Key, force_next: bool) -> Result<Option<Option<Pair>>> {
        let cache = self.last_frame.borrow();
        let Some(frame) = cache.as_ref() else {
            return Ok(None);
        };
        let pairs = frame.pairs()?;
        let (Some(first), Some(last)) = (pairs.first(), pairs.last()) else {
            return Ok(None);
        };
        if key < &first.0 || key >= &last.0 {
            return Ok(None);
        }
        let idx = if force_next {
            pairs.partition_point(|(k, _)| k <= key)
        } else {
            pairs.partition_point(|(k, _)| k < key)
        };
        Ok(Some(pairs.get(idx).cloned()))
    }

    /// First visible pair at or after `key` (strictly after with `force_next`).
    pub fn at_or_next(&self, key: &Key, force_next: bool) -> Result<Option<Pair>> {
        if self.caching {
            if let Some(answer) = self.cached_answer(key, force_next)? {
                return Ok(answer);
            }
        }
        let bounds = KeyRange {
            low: Some(key.clone()),
            exclude_low: force_next,
            ..KeyRange::default()
        };
        for frame in self.scan(bounds)? {
            let frame = frame?;
            let Some(pair) = frame.pairs()?.first().cloned() else {
                continue;
            };
            if self.caching {
                *self.last_frame.borrow_mut() = Some(frame);
            }
            return Ok(Some(pair));
        }
        Ok(None)
    }

    pub fn first(&self) -> Result<Option<Pair>> {
        self.at_or_next(&Key::default(), false)
    }

    pub fn next_after(&self, key: &Key) -> Result<Option<Pair>> {
        self.at_or_next(key, true)
    }
}

impl FrameSource for ShadowTree {
    fn get(&self, key: &Key) -> Result<Option<Value>> {
        ShadowTree::get(self, key)
    }

    fn leaf_frames(&self, from: Option<&Key>, inclusive: bool) -> Result<FrameStream<'_>> {
        self.frames(from, inclusive, false)
    }

    fn index_of(&self, key: &Key) -> Result<u64> {
        Ok(self.white.index_of(key)? + self.grey.index_of(key)?)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.white.last_index()? + self.grey.last_index()?)
    }
}

/// Iterates visible pairs of a shadow tree within a range, one at a time.
pub struct Cursor<'a> {
    tree: &'a ShadowTree,
    position: Option<Key>,
    high: Option<Key>,
    started: bool,
}

impl<'a> Cursor<'a> {
    pub fn new(tree: &'a ShadowTree) -> Self {
        Self {
            tree,
            position: None,
            high: None,
            started: false,
        }
    }

    /// Restart at `low` (inclusive) and stop after `high` (inclusive).
    pub fn set_range(&mut self, low: Option<Key>, high: Option<Key>) {
        self.position = low;
        self.high = high;
        self.started = false;
    }

    fn step(&mut self) -> Result<Option<Pair>> {
        let next = match (&self.position, self.started) {
            (None, _) => self.tree.first()?,
            (Some(key), started) => self.tree.at_or_next(key, started)?,
        };
        self.started = true;
        let Some(pair) = next else {
            return Ok(None);
        };
        if self.high.as_ref().is_some_and(|high| &pair.0 > high) {
            return Ok(None);
        }
        self.position = Some(pair.0.clone());
        Ok(Some(pair))
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Pair>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeOptions;
    use tempfile::TempDir;

    fn key(s: &str) -> Key {
        Key::new([s])
    }

    fn grey_tree(dir: &TempDir) -> SortedTree {
        let pairs: Vec<Pair> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|k| (key(k), Value::from(format!("grey-{k}"))))
            .collect();
        SortedTree::create(
            &dir.path().join("g.ktree"),
            stream::from_sorted_pairs(pairs, 64),
            &TreeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn buffers_and_trees_start_frames_alike() {
        let dir = TempDir::new().unwrap();
        let tree = grey_tree(&dir);
        let mut buffer = TinyBuffer::new();
        for (k, v) in tree.scan().unwrap() {
            buffer.put(k, v).unwrap();
        }
        let after = |source: &dyn FrameSource, from: &str, inclusive: bool| -> Vec<Key> {
            let from = key(from);
            stream::collect_pairs(source.leaf_frames(Some(&from), inclusive).unwrap())
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .filter(|k| if inclusive { *k >= from } else { *k > from })
                .collect()
        };
        for (from, inclusive) in [("b", true), ("b", false), ("e", true), ("e", false)] {
            assert_eq!(
                after(&tree, from, inclusive),
                after(&buffer, from, inclusive),
                "{from} {inclusive}"
            );
        }
        let last = key("e");
        assert!(stream::collect_pairs(buffer.leaf_frames(Some(&last), false).unwrap())
            .unwrap()
            .is_empty());
        assert!(stream::collect_pairs(tree.leaf_frames(Some(&last), false).unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn white_masks_grey() {
        let dir = TempDir::new().unwrap();
        let mut shadow =
            ShadowTree::new(Layer::Buffer(TinyBuffer::new()), Box::new(grey_tree(&dir)));
        shadow.put(key("b"), Value::from("white-b")).unwrap();
        shadow.delete(key("c")).unwrap();
        shadow.put(key("f"), Value::from("white-f")).unwrap();

        assert_eq!(shadow.get(&key("a")).unwrap(), Some(Value::from("grey-a")));
        assert_eq!(shadow.get(&key("b")).unwrap(), Some(Value::from("white-b")));
        assert_eq!(shadow.get(&key("c")).unwrap(), None);
        let all = shadow.range_pairs(&Key::default(), &Key::max()).unwrap();
        let keys: Vec<Key> = all.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key("a"), key("b"), key("d"), key("e"), key("f")]);

        let raw = stream::collect_pairs(shadow.frames(None, true, true).unwrap()).unwrap();
        assert!(raw.iter().any(|(k, v)| *k == key("c") && v.is_tombstone()));
    }

    #[test]
    fn direct_tombstone_write_rejected() {
        let mut shadow = ShadowTree::new(Layer::Buffer(TinyBuffer::new()), Box::new(EmptySource));
        assert!(matches!(
            shadow.put(key("x"), Value::Tombstone),
            Err(FramedexError::TombstoneWrite { .. })
        ));
        let mut frozen =
            ShadowTree::new(Layer::Buffer(TinyBuffer::read_only_empty()), Box::new(EmptySource));
        assert!(matches!(
            frozen.put(key("x"), Value::Unit),
            Err(FramedexError::ReadOnly)
        ));
    }

    #[test]
    fn stacked_shadows_and_cursor() {
        let dir = TempDir::new().unwrap();
        let mut inner =
            ShadowTree::new(Layer::Buffer(TinyBuffer::new()), Box::new(grey_tree(&dir)));
        inner.delete(key("a")).unwrap();
        let mut outer = ShadowTree::new(Layer::Buffer(TinyBuffer::new()), Box::new(inner))
            .with_caching(true);
        outer.put(key("a"), Value::from("outer-a")).unwrap();
        outer.delete(key("e")).unwrap();

        let mut cursor = Cursor::new(&outer);
        cursor.set_range(Some(key("a")), Some(key("d")));
        let seen: Vec<Key> = cursor.map(|p| p.unwrap().0).collect();
        assert_eq!(seen, vec![key("a"), key("b"), key("c"), key("d")]);
        assert_eq!(outer.next_after(&key("d")).unwrap(), None);
        assert_eq!(
            outer.next_after(&key("b")).unwrap().map(|p| p.0),
            Some(key("c"))
        );
        assert_eq!(outer.first().unwrap().unwrap().1, Value::from("outer-a"));
    }

    #[test]
    fn buffer_persists_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.tiny");
        let mut buffer = TinyBuffer::open(&path, false).unwrap();
        buffer.put(key("k"), Value::Int(5)).unwrap();
        buffer.put(key("gone"), Value::Tombstone).unwrap();
        buffer.sync().unwrap();
        let reopened = TinyBuffer::open(&path, true).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.lookup(&key("k")), Some(&Value::Int(5)));
    }
}
