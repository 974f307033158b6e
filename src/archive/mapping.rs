//! A session's view of one archive.
//!
//! The view stacks, from the bottom: the active base tree, the active
//! transient tree, the union of recent buffers (every active one plus this
//! session's waiting ones, later files winning), and the session's own
//! undecided buffer on top. Files are resolved when the mapping opens, so the
//! view is a snapshot that compaction elsewhere does not disturb.

use std::path::PathBuf;
use std::rc::Rc;

use super::layered::LayeredArchive;
use super::layout::{Area, Level};
use crate::error::{FramedexError, Result};
use crate::frames::shadow::{Cursor, load_pairs};
use crate::frames::stream::KeyRange;
use crate::frames::{FrameSource, FrameStream, Layer, ShadowTree, TinyBuffer};
use crate::io::naming;
use crate::types::{Key, Pair, Value};

pub struct SessionMapping {
    archive: Rc<LayeredArchive>,
    session: String,
    read_only: bool,
    undecided_path: PathBuf,
    tree: ShadowTree,
}

impl std::fmt::Debug for SessionMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMapping")
            .field("root", &self.archive.root())
            .field("session", &self.session)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl SessionMapping {
    pub fn open(archive: Rc<LayeredArchive>, session: &str, read_only: bool) -> Result<Self> {
        // Newest level first. A compaction that lands in between can then
        // only repeat rows in a lower level, never skip them.
        let recent_files = archive.recent_files_for(session)?;
        let mut recent = TinyBuffer::new();
        for path in &recent_files {
            recent.absorb(load_pairs(path)?);
        }
        let transient = archive.transient_tree()?;
        let mut grey: Box<dyn FrameSource> = Box::new(archive.base_tree()?);
        if let Some(transient) = transient {
            grey = Box::new(ShadowTree::new(Layer::Tree(transient), grey));
        }
        if !recent_files.is_empty() {
            grey = Box::new(ShadowTree::new(Layer::Buffer(recent), grey));
        }

        let undecided_path = archive.undecided_path(session);
        let existing = archive
            .surrogate()
            .exists(&undecided_path)?
            .then(|| archive.surrogate().resolve(&undecided_path))
            .transpose()?
            .flatten();
        let undecided = match existing {
            Some(path) => TinyBuffer::open(&path, read_only)?,
            None if read_only => TinyBuffer::read_only_empty(),
            None => TinyBuffer::open(&undecided_path, false)?,
        };
        let tree = ShadowTree::new(Layer::Buffer(undecided), grey).with_caching(true);
        tracing::debug!(
            root = %archive.root().display(),
            session,
            recent = recent_files.len(),
            read_only,
            "session mapping opened"
        );
        Ok(Self {
            archive,
            session: session.to_owned(),
            read_only,
            undecided_path,
            tree,
        })
    }

    /// Rebuild the view from the files currently in the archive.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::open(Rc::clone(&self.archive), &self.session, self.read_only)?;
        Ok(())
    }

    pub fn archive(&self) -> &LayeredArchive {
        &self.archive
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn tree(&self) -> &ShadowTree {
        &self.tree
    }

    fn undecided(&self) -> Option<&TinyBuffer> {
        self.tree.white().as_buffer()
    }

    /// True when the undecided buffer holds uncommitted changes.
    pub fn has_changes(&self) -> bool {
        self.undecided().is_some_and(|b| !b.is_empty())
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(FramedexError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.tree.get(key)
    }

    pub fn has(&self, key: &Key) -> Result<bool> {
        self.tree.has(key)
    }

    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        self.writable()?;
        self.tree.put(key, value)
    }

    pub fn put_all(&mut self, pairs: impl IntoIterator<Item = Pair>) -> Result<()> {
        for (key, value) in pairs {
            self.put(key, value)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.writable()?;
        self.tree.delete(key)
    }

    pub fn first(&self) -> Result<Option<Pair>> {
        self.tree.first()
    }

    pub fn at_or_next(&self, key: &Key, force_next: bool) -> Result<Option<Pair>> {
        self.tree.at_or_next(key, force_next)
    }

    /// The visible pair strictly after `key`.
    pub fn next_after(&self, key: &Key) -> Result<Option<Pair>> {
        let next = self.tree.next_after(key)?;
        if let Some((found, _)) = &next {
            if found <= key {
                return Err(FramedexError::out_of_order(format!(
                    "cursor did not advance past {key}"
                )));
            }
        }
        Ok(next)
    }

    pub fn index_of(&self, key: &Key) -> Result<u64> {
        self.tree.index_of(key)
    }

    pub fn last_index(&self) -> Result<u64> {
        self.tree.last_index()
    }

    pub fn scan(&self, bounds: KeyRange) -> Result<FrameStream<'_>> {
        self.tree.scan(bounds)
    }

    /// Visible pairs with `low <= key <= high`, stopping after `limit` pairs.
    pub fn range_pairs(&self, low: &Key, high: &Key, limit: Option<usize>) -> Result<Vec<Pair>> {
        let Some(limit) = limit else {
            return self.tree.range_pairs(low, high);
        };
        let mut out = Vec::new();
        for frame in self.scan(KeyRange::between(low.clone(), high.clone()))? {
            for pair in frame?.into_pairs()? {
                if out.len() >= limit {
                    return Ok(out);
                }
                out.push(pair);
            }
        }
        Ok(out)
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(&self.tree)
    }

    /// Write the undecided buffer to disk without publishing it.
    pub fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.tree.finalize()
    }

    /// Publish the undecided buffer into `recent`. A lazy store goes to
    /// `recent/waiting` and stays visible only to this session until the next
    /// aggregation. An empty buffer is discarded instead.
    pub fn store(&mut self, lazy: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if !self.has_changes() {
            return self.discard();
        }
        self.sync()?;
        let area = if lazy { Area::Waiting } else { Area::Active };
        let name = naming::recent_name(&self.session);
        let archive = Rc::clone(&self.archive);
        let source = self.current_undecided_path()?;
        archive.move_file(&source, &archive.layout().dir(Level::Recent, area), Some(&name))?;
        tracing::debug!(session = %self.session, %name, lazy, "session stored");
        self.reload()
    }

    /// Drop uncommitted changes. The buffer file, if any, is retired.
    pub fn discard(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let archive = Rc::clone(&self.archive);
        if archive.surrogate().exists(&self.undecided_path)? {
            let source = self.current_undecided_path()?;
            archive.move_file(
                &source,
                &archive.layout().dir(Level::Undecided, Area::Retired),
                None,
            )?;
        }
        tracing::debug!(session = %self.session, "session discarded");
        self.reload()
    }

    fn current_undecided_path(&self) -> Result<PathBuf> {
        self.archive
            .surrogate()
            .resolve(&self.undecided_path)?
            .ok_or_else(|| FramedexError::layout(&self.undecided_path, "undecided buffer is pending removal"))
    }
}
