//! Layered archive: one index stored as levels of buffers and sorted trees.
//!
//! Writers only ever add files. Compaction builds new trees in a `prepared`
//! area, renames them into `active`, and renames their predecessors into
//! `retired`. Clean-up deletes retired files later, so readers holding older
//! files keep a consistent snapshot.

use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::layout::{Area, ArchiveLayout, Level};
use crate::error::{FramedexError, Result};
use crate::frames::shadow::load_pairs;
use crate::frames::tree::merge_trees;
use crate::frames::{FrameStream, ScatterSorter, SortedTree, TinyBuffer, stream};
use crate::io::naming;
use crate::io::{Completion, Surrogate};
use crate::types::{AggregateMode, ArchiveOptions};

/// Result of a compaction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateOutcome {
    /// False when another compaction held the lock.
    pub locked: bool,
    /// Pairs folded into the next level. Move-to-base reports the position
    /// estimate of the transient tree.
    pub moved: u64,
}

impl AggregateOutcome {
    fn contended() -> Self {
        Self::default()
    }

    fn done(moved: u64) -> Self {
        Self {
            locked: true,
            moved,
        }
    }
}

/// Exclusive compaction lock, released on drop.
///
/// Held as a uniquely named file in both `transient/prepared` and
/// `base/prepared`, each also under an advisory exclusive lock.
pub struct CompactionLock<'a> {
    surrogate: &'a Surrogate,
    files: Vec<(PathBuf, fs_err::File)>,
}

impl CompactionLock<'_> {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|(path, _)| path.as_path())
    }
}

impl Drop for CompactionLock<'_> {
    fn drop(&mut self) {
        for (path, file) in self.files.drain(..) {
            if let Err(err) = FileExt::unlock(file.file()) {
                tracing::warn!(lock = %path.display(), error = %err, "failed to unlock");
            }
            drop(file);
            match self.surrogate.remove(&path) {
                Ok(Completion::Deferred) => {
                    tracing::warn!(lock = %path.display(), "lock file removal deferred");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(lock = %path.display(), error = %err, "failed to remove lock file");
                }
            }
        }
    }
}

/// A persistent multi-level archive directory.
#[derive(Debug)]
pub struct LayeredArchive {
    layout: ArchiveLayout,
    surrogate: Surrogate,
    options: ArchiveOptions,
}

impl LayeredArchive {
    /// Create the directory layout (keeping anything already there) and an
    /// empty base tree when none is active.
    pub fn create(root: impl Into<PathBuf>, options: ArchiveOptions) -> Result<Self> {
        let archive = Self {
            layout: ArchiveLayout::new(root),
            surrogate: Surrogate::default(),
            options,
        };
        archive.layout.create_dirs()?;
        if archive.current_tree(Level::Base)?.is_none() {
            let path = archive
                .layout
                .dir(Level::Base, Area::Active)
                .join(naming::base_tree_name());
            drop(SortedTree::create_empty(&path, &options.tree)?);
        }
        tracing::debug!(root = %archive.layout.root().display(), "archive created");
        Ok(archive)
    }

    /// Open an existing archive, checking its layout and base tree.
    pub fn open(root: impl Into<PathBuf>, options: ArchiveOptions) -> Result<Self> {
        let archive = Self {
            layout: ArchiveLayout::new(root),
            surrogate: Surrogate::default(),
            options,
        };
        archive.layout.validate()?;
        if archive.current_tree(Level::Base)?.is_none() {
            return Err(FramedexError::layout(
                archive.layout.root(),
                "no active base tree",
            ));
        }
        tracing::debug!(root = %archive.layout.root().display(), "archive opened");
        Ok(archive)
    }

    pub fn open_or_create(root: impl Into<PathBuf>, options: ArchiveOptions) -> Result<Self> {
        let root = root.into();
        if root.is_dir() {
            Self::open(root, options)
        } else {
            Self::create(root, options)
        }
    }

    /// Replace the filesystem backend.
    #[must_use]
    pub fn with_surrogate(mut self, surrogate: Surrogate) -> Self {
        self.surrogate = surrogate;
        self
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    pub fn surrogate(&self) -> &Surrogate {
        &self.surrogate
    }

    /// Visible file names of an area, sorted.
    pub fn list(&self, level: Level, area: Area) -> Result<Vec<String>> {
        self.surrogate.list_dir(&self.layout.dir(level, area))
    }

    /// Real path of a visible file.
    pub fn resolve(&self, level: Level, area: Area, name: &str) -> Result<PathBuf> {
        let path = self.layout.dir(level, area).join(name);
        self.surrogate
            .resolve(&path)?
            .ok_or_else(|| FramedexError::layout(path, "file is pending removal"))
    }

    /// Newest active tree of a tree level.
    pub fn current_tree(&self, level: Level) -> Result<Option<PathBuf>> {
        let newest = self
            .list(level, Area::Active)?
            .into_iter()
            .filter(|name| naming::is_tree(name))
            .next_back();
        newest
            .map(|name| self.resolve(level, Area::Active, &name))
            .transpose()
    }

    pub fn base_tree(&self) -> Result<SortedTree> {
        let path = self
            .current_tree(Level::Base)?
            .ok_or_else(|| FramedexError::layout(self.root(), "no active base tree"))?;
        SortedTree::open(&path, &self.options.tree)
    }

    pub fn transient_tree(&self) -> Result<Option<SortedTree>> {
        self.current_tree(Level::Transient)?
            .map(|path| SortedTree::open(&path, &self.options.tree))
            .transpose()
    }

    /// Recent buffers visible to `session`: every active file plus the
    /// session's own waiting files, oldest first.
    pub fn recent_files_for(&self, session: &str) -> Result<Vec<PathBuf>> {
        let mut named = Vec::new();
        for name in self.list(Level::Recent, Area::Active)? {
            if naming::is_buffer(&name) {
                named.push((name, Area::Active));
            }
        }
        for name in self.list(Level::Recent, Area::Waiting)? {
            if naming::is_recent_of(&name, session) {
                named.push((name, Area::Waiting));
            }
        }
        named.sort();
        named
            .into_iter()
            .map(|(name, area)| self.resolve(Level::Recent, area, &name))
            .collect()
    }

    /// Every active and waiting recent buffer, oldest first.
    fn all_recent_files(&self) -> Result<Vec<PathBuf>> {
        let mut named = Vec::new();
        for area in [Area::Active, Area::Waiting] {
            for name in self.list(Level::Recent, area)? {
                if naming::is_buffer(&name) {
                    named.push((name, area));
                }
            }
        }
        named.sort();
        named
            .into_iter()
            .map(|(name, area)| self.resolve(Level::Recent, area, &name))
            .collect()
    }

    pub fn undecided_path(&self, session: &str) -> PathBuf {
        self.layout
            .dir(Level::Undecided, Area::Active)
            .join(naming::buffer_name(session))
    }

    /// Move `from` into `dir`, replacing a same-named file there.
    pub fn move_file(&self, from: &Path, dir: &Path, name: Option<&str>) -> Result<PathBuf> {
        let name = match name {
            Some(name) => name.to_owned(),
            None => from
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| FramedexError::layout(from, "path has no file name"))?,
        };
        let to = dir.join(name);
        if self.surrogate.exists(&to)? {
            self.surrogate.remove(&to)?;
        }
        self.surrogate.rename(from, &to)?;
        Ok(to)
    }

    /// Take the compaction lock, or report contention.
    ///
    /// Both prepared directories must be empty. After writing the lock files
    /// they are listed again so that two racing writers cannot both win.
    pub fn try_lock(&self, die_on_failure: bool) -> Result<Option<CompactionLock<'_>>> {
        let owner = naming::session_id();
        let lock_name = naming::lock_name(&owner);
        let mut lock = CompactionLock {
            surrogate: &self.surrogate,
            files: Vec::new(),
        };
        let dirs = [
            self.layout.dir(Level::Transient, Area::Prepared),
            self.layout.dir(Level::Base, Area::Prepared),
        ];
        let mut acquired = true;
        for dir in &dirs {
            if !self.surrogate.list_dir(dir)?.is_empty() {
                acquired = false;
                break;
            }
            let path = dir.join(&lock_name);
            let file = fs_err::File::create(&path)?;
            let held = file.file().try_lock_exclusive().is_ok();
            lock.files.push((path, file));
            if !held {
                acquired = false;
                break;
            }
        }
        if acquired {
            for dir in &dirs {
                if self.surrogate.list_dir(dir)? != [lock_name.as_str()] {
                    acquired = false;
                    break;
                }
            }
        }
        if acquired {
            return Ok(Some(lock));
        }
        drop(lock);
        tracing::info!(root = %self.root().display(), "compaction lock is held elsewhere");
        if die_on_failure {
            return Err(FramedexError::Lock {
                path: self.root().to_path_buf(),
            });
        }
        Ok(None)
    }

    fn uses_memory(&self, total_bytes: u64) -> bool {
        match self.options.aggregate_mode {
            AggregateMode::InMemory => true,
            AggregateMode::Scatter => false,
            AggregateMode::Auto => total_bytes <= self.options.in_memory_merge_bytes,
        }
    }

    /// Fold every recent buffer into a new transient tree.
    pub fn aggregate(&self, die_on_failure: bool) -> Result<AggregateOutcome> {
        let Some(lock) = self.try_lock(die_on_failure)? else {
            return Ok(AggregateOutcome::contended());
        };
        let recent = self.all_recent_files()?;
        if recent.is_empty() {
            tracing::debug!(root = %self.root().display(), "nothing to aggregate");
            return Ok(AggregateOutcome::done(0));
        }
        let mut total_bytes = 0;
        for path in &recent {
            total_bytes += fs_err::metadata(path)?.len();
        }
        let in_memory = self.uses_memory(total_bytes);
        tracing::info!(
            root = %self.root().display(),
            files = recent.len(),
            total_bytes,
            in_memory,
            "aggregating recent buffers"
        );

        let node_bytes = self.options.tree.node_bytes;
        let mut moved = 0_u64;
        let sorted: FrameStream<'static> = if in_memory {
            let mut merged = TinyBuffer::new();
            for path in &recent {
                let pairs = load_pairs(path)?;
                moved += pairs.len() as u64;
                merged.absorb(pairs);
            }
            stream::from_sorted_pairs(merged.into_pairs(), node_bytes)
        } else {
            let scratch_dir = self.layout.dir(Level::Recent, Area::Prepared);
            let mut sorter = ScatterSorter::new(&scratch_dir, self.options.sorter, true)?;
            for path in &recent {
                sorter.analyze(&load_pairs(path)?)?;
            }
            for path in &recent {
                let pairs = load_pairs(path)?;
                moved += pairs.len() as u64;
                sorter.scatter_dictionary(pairs)?;
            }
            sorter.into_frames()
        };

        let transient = self.transient_tree()?;
        let prepared = self
            .layout
            .dir(Level::Transient, Area::Prepared)
            .join(naming::transient_tree_name());
        let merged = match &transient {
            Some(tree) => stream::merge(sorted, tree.leaf_frames(None, true)?, true),
            None => sorted,
        };
        drop(SortedTree::create(&prepared, merged, &self.options.tree)?);
        self.move_file(&prepared, &self.layout.dir(Level::Transient, Area::Active), None)?;

        let old_transient = transient.map(|tree| tree.path().to_path_buf());
        if let Some(path) = old_transient {
            self.move_file(&path, &self.layout.dir(Level::Transient, Area::Retired), None)?;
        }
        let retired = self.layout.dir(Level::Recent, Area::Retired);
        for path in &recent {
            self.move_file(path, &retired, None)?;
        }
        drop(lock);
        tracing::info!(root = %self.root().display(), moved, "aggregation finished");
        if self.options.auto_clean {
            self.clean_up(true)?;
        }
        Ok(AggregateOutcome::done(moved))
    }

    /// Fold the transient tree into a new base tree.
    pub fn move_to_base(&self, die_on_failure: bool) -> Result<AggregateOutcome> {
        let Some(lock) = self.try_lock(die_on_failure)? else {
            return Ok(AggregateOutcome::contended());
        };
        let Some(transient) = self.transient_tree()? else {
            return Ok(AggregateOutcome::done(0));
        };
        let base = self.base_tree()?;
        let prepared = self
            .layout
            .dir(Level::Base, Area::Prepared)
            .join(naming::base_tree_name());
        let moved = transient.last_index()?;
        drop(merge_trees(&base, &transient, &prepared, true, &self.options.tree)?);
        let old_base = base.path().to_path_buf();
        let old_transient = transient.path().to_path_buf();
        drop(base);
        drop(transient);

        let installed = self.move_file(&prepared, &self.layout.dir(Level::Base, Area::Active), None)?;
        if installed == old_base || same_file::is_same_file(&installed, &old_base).unwrap_or(false) {
            return Err(FramedexError::layout(
                installed,
                "new base tree replaced its predecessor in place",
            ));
        }
        self.move_file(&old_base, &self.layout.dir(Level::Base, Area::Retired), None)?;
        self.move_file(
            &old_transient,
            &self.layout.dir(Level::Transient, Area::Retired),
            None,
        )?;
        drop(lock);
        tracing::info!(root = %self.root().display(), moved, "transient moved to base");
        Ok(AggregateOutcome::done(moved))
    }

    fn unlink_all(&self, level: Level, area: Area) -> Result<usize> {
        let dir = self.layout.dir(level, area);
        let mut removed = 0;
        for name in self.surrogate.list_dir(&dir)? {
            if name.starts_with(".nfs") {
                continue;
            }
            if self.surrogate.remove(&dir.join(&name))? == Completion::Done {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn compaction_running(&self) -> Result<bool> {
        for level in [Level::Transient, Level::Base] {
            if self
                .list(level, Area::Prepared)?
                .iter()
                .any(|name| naming::is_lock(name))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Finish deferred operations and delete retired files. A complete
    /// clean-up also empties the prepared areas when no compaction is running.
    /// Active and waiting files are never touched. Returns the number of files
    /// deleted.
    pub fn clean_up(&self, complete: bool) -> Result<usize> {
        for (level, area) in self.layout.areas() {
            self.surrogate.fix_pending(&self.layout.dir(level, area))?;
        }
        let mut removed = 0;
        for level in Level::ALL {
            removed += self.unlink_all(level, Area::Retired)?;
        }
        if complete {
            if self.compaction_running()? {
                tracing::debug!(root = %self.root().display(), "compaction running; prepared areas kept");
            } else {
                for level in Level::ALL {
                    if level.has_area(Area::Prepared) {
                        removed += self.unlink_all(level, Area::Prepared)?;
                    }
                }
            }
        }
        log::info!(
            "clean-up of {} removed {} files",
            self.root().display(),
            removed
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::shadow::write_pairs;
    use crate::types::{Key, Pair, Value};
    use tempfile::TempDir;

    fn key(i: u32) -> Key {
        Key::new([format!("k{i:04}")])
    }

    fn publish(archive: &LayeredArchive, area: Area, session: &str, pairs: &[Pair]) {
        let path = archive
            .layout()
            .dir(Level::Recent, area)
            .join(naming::recent_name(session));
        write_pairs(&path, pairs.iter().map(|(k, v)| (k, v))).unwrap();
    }

    fn visible(archive: &LayeredArchive) -> Vec<Pair> {
        let mut tree_pairs = archive.base_tree().unwrap().scan().unwrap();
        if let Some(t) = archive.transient_tree().unwrap() {
            let newer: std::collections::BTreeMap<Key, Value> = t.scan().unwrap().into_iter().collect();
            let mut all: std::collections::BTreeMap<Key, Value> = tree_pairs.into_iter().collect();
            all.extend(newer);
            tree_pairs = all.into_iter().collect();
        }
        tree_pairs.into_iter().filter(|(_, v)| !v.is_tombstone()).collect()
    }

    #[test]
    fn create_makes_empty_base() {
        let tmp = TempDir::new().unwrap();
        let archive = LayeredArchive::create(tmp.path().join("a"), ArchiveOptions::default()).unwrap();
        let base = archive.base_tree().unwrap();
        assert!(base.is_empty());
        assert!(archive.transient_tree().unwrap().is_none());
        drop(base);
        LayeredArchive::open(tmp.path().join("a"), ArchiveOptions::default()).unwrap();
        assert!(LayeredArchive::open(tmp.path().join("missing"), ArchiveOptions::default()).is_err());
    }

    fn aggregate_round(mode: AggregateMode) {
        let tmp = TempDir::new().unwrap();
        let options = ArchiveOptions {
            aggregate_mode: mode,
            sorter: crate::types::SorterOptions {
                bucket_bytes: 256,
                seed: Some(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let archive = LayeredArchive::create(tmp.path().join("a"), options).unwrap();
        let first: Vec<Pair> = (0..300).map(|i| (key(i), Value::Int(1))).collect();
        let second: Vec<Pair> = (200..400)
            .map(|i| (key(i), if i % 50 == 0 { Value::Tombstone } else { Value::Int(2) }))
            .collect();
        publish(&archive, Area::Active, "s1", &first);
        publish(&archive, Area::Waiting, "s2", &second);

        let outcome = archive.aggregate(true).unwrap();
        assert!(outcome.locked);
        assert_eq!(outcome.moved, 500);
        assert!(archive.list(Level::Recent, Area::Active).unwrap().is_empty());
        assert!(archive.list(Level::Recent, Area::Waiting).unwrap().is_empty());
        assert_eq!(archive.list(Level::Recent, Area::Retired).unwrap().len(), 2);

        let before = visible(&archive);
        assert_eq!(before.len(), 400 - 4);
        assert_eq!(before[10], (key(10), Value::Int(1)));
        let overwritten = before.iter().find(|(k, _)| *k == key(260)).unwrap();
        assert_eq!(overwritten.1, Value::Int(2));
        assert!(before.iter().all(|(k, _)| *k != key(250)));

        let moved = archive.move_to_base(true).unwrap();
        assert!(moved.locked);
        assert!(archive.transient_tree().unwrap().is_none());
        assert_eq!(visible(&archive), before);
        // Moving into an empty base drops tombstones too.
        assert_eq!(archive.base_tree().unwrap().scan().unwrap(), before);

        // A second round merges into the non-empty base and drops tombstones.
        publish(&archive, Area::Active, "s3", &[(key(0), Value::Tombstone)]);
        archive.aggregate(true).unwrap();
        archive.move_to_base(true).unwrap();
        let base = archive.base_tree().unwrap().scan().unwrap();
        assert!(base.iter().all(|(_, v)| !v.is_tombstone()));
        assert_eq!(base.len(), 400 - 5);

        assert!(archive.clean_up(false).unwrap() > 0);
        assert!(archive.list(Level::Base, Area::Retired).unwrap().is_empty());
        assert_eq!(archive.list(Level::Base, Area::Active).unwrap().len(), 1);
    }

    #[test]
    fn aggregate_in_memory_preserves_content() {
        aggregate_round(AggregateMode::InMemory);
    }

    #[test]
    fn aggregate_by_scatter_preserves_content() {
        aggregate_round(AggregateMode::Scatter);
    }

    #[test]
    fn lock_contention_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let archive = LayeredArchive::create(tmp.path().join("a"), ArchiveOptions::default()).unwrap();
        let held = archive.try_lock(true).unwrap().unwrap();
        assert_eq!(held.paths().count(), 2);

        let outcome = archive.aggregate(false).unwrap();
        assert!(!outcome.locked);
        let err = archive.move_to_base(true).unwrap_err();
        assert!(err.is_lock_contention());

        // Complete clean-up keeps prepared files while a lock is present.
        let stray = archive.layout().dir(Level::Base, Area::Prepared).join("stray.ktree");
        fs_err::write(&stray, b"x").unwrap();
        archive.clean_up(true).unwrap();
        assert!(stray.exists());

        drop(held);
        archive.clean_up(true).unwrap();
        assert!(!stray.exists());
        assert!(archive.aggregate(true).unwrap().locked);
    }
}
