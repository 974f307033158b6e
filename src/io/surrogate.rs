//! Deferred rename and unlink for files that cannot be changed right now.
//!
//! Some platforms refuse to rename or delete a file while another handle has
//! it open. When the backend refuses, the operation is recorded in marker files
//! beside the affected names and every directory read goes through this module
//! so the archive sees the intended state:
//!
//! - `__FIND__{name}` in the destination directory points at the real file;
//! - `__MOVE__{name}` in the source directory hides the file being moved;
//! - `__DEL__{name}` hides a file awaiting deletion.
//!
//! [`Surrogate::fix_pending`] retries recorded operations and is idempotent.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{SURROGATE_RETRY_LIMIT, SURROGATE_RETRY_SLEEP_MS};
use crate::error::{FramedexError, Result};

const FIND_PREFIX: &str = "__FIND__";
const MOVE_PREFIX: &str = "__MOVE__";
const DELETE_PREFIX: &str = "__DEL__";

/// The filesystem calls that may be refused.
pub trait FileOps {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Plain OS calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileOps;

impl FileOps for OsFileOps {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs_err::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs_err::remove_file(path)
    }
}

/// An operation recorded in a marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOp {
    Move { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Recorded in marker files; finished later by `fix_pending`.
    Deferred,
    /// Nothing to act on.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Find,
    Move,
    Delete,
}

impl MarkerKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Find => FIND_PREFIX,
            Self::Move => MOVE_PREFIX,
            Self::Delete => DELETE_PREFIX,
        }
    }

    fn split(name: &str) -> Option<(Self, &str)> {
        [Self::Find, Self::Move, Self::Delete]
            .into_iter()
            .find_map(|kind| name.strip_prefix(kind.prefix()).map(|rest| (kind, rest)))
    }
}

fn marker(path: &Path, kind: MarkerKind) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{name}", kind.prefix()))
}

fn surrogate_error(path: &Path, reason: impl Into<String>) -> FramedexError {
    FramedexError::Surrogate {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_op(path: &Path) -> Result<PendingOp> {
    let bytes = fs_err::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_op(path: &Path, op: &PendingOp) -> Result<()> {
    fs_err::write(path, serde_json::to_vec(op)?)?;
    Ok(())
}

/// Remove a marker file, retrying while the filesystem refuses.
fn clear_marker(path: &Path) -> Result<()> {
    let mut attempts = 0;
    while path.exists() {
        attempts += 1;
        if attempts > SURROGATE_RETRY_LIMIT {
            return Err(surrogate_error(path, "marker removal retry limit exceeded"));
        }
        if let Err(err) = fs_err::remove_file(path) {
            tracing::debug!(marker = %path.display(), error = %err, "marker busy; retrying");
            std::thread::sleep(Duration::from_millis(SURROGATE_RETRY_SLEEP_MS));
        }
    }
    Ok(())
}

/// Marker-aware view of the filesystem.
pub struct Surrogate {
    ops: Box<dyn FileOps>,
}

impl std::fmt::Debug for Surrogate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surrogate").finish_non_exhaustive()
    }
}

impl Default for Surrogate {
    fn default() -> Self {
        Self::new(OsFileOps)
    }
}

impl Surrogate {
    pub fn new(ops: impl FileOps + 'static) -> Self {
        Self { ops: Box::new(ops) }
    }

    /// Follow a find marker to the file it stands for.
    fn find_target(&self, find_marker: &Path) -> Result<Option<PathBuf>> {
        let mut visited = HashSet::new();
        let mut current = find_marker.to_path_buf();
        loop {
            if !current.exists() {
                return Ok(None);
            }
            if !visited.insert(current.clone()) {
                return Err(surrogate_error(&current, "find markers form a loop"));
            }
            let PendingOp::Move { from, .. } = read_op(&current)? else {
                return Err(surrogate_error(&current, "find marker holds a delete"));
            };
            if from.exists() {
                return Ok(Some(from));
            }
            current = marker(&from, MarkerKind::Find);
        }
    }

    /// Whether `path` exists once pending operations are taken into account.
    pub fn exists(&self, path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(!marker(path, MarkerKind::Delete).exists()
                && !marker(path, MarkerKind::Move).exists());
        }
        let find = marker(path, MarkerKind::Find);
        Ok(find.exists() && self.find_target(&find)?.is_some())
    }

    /// The real location of `path`, or `None` when it is pending removal.
    ///
    /// A path that does not exist at all resolves to itself.
    pub fn resolve(&self, path: &Path) -> Result<Option<PathBuf>> {
        if path.exists() {
            if marker(path, MarkerKind::Delete).exists() || marker(path, MarkerKind::Move).exists() {
                return Ok(None);
            }
            return Ok(Some(path.to_path_buf()));
        }
        let find = marker(path, MarkerKind::Find);
        if find.exists() {
            return match self.find_target(&find)? {
                Some(real) => Ok(Some(real)),
                None => Err(surrogate_error(&find, "find marker points at a missing file")),
            };
        }
        Ok(Some(path.to_path_buf()))
    }

    /// File names in `dir` as they will be once pending operations complete.
    /// Markers are hidden. Names are sorted.
    pub fn list_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut visible = BTreeSet::new();
        let mut hidden = BTreeSet::new();
        for entry in fs_err::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            match MarkerKind::split(&name) {
                None => {
                    visible.insert(name.clone());
                }
                Some((MarkerKind::Find, real)) => {
                    if self.find_target(&dir.join(&name))?.is_some() {
                        visible.insert(real.to_owned());
                    }
                }
                Some((_, real)) => {
                    hidden.insert(real.to_owned());
                }
            }
        }
        Ok(visible
            .into_iter()
            .filter(|name| !hidden.contains(name))
            .collect())
    }

    /// Delete `path`, or record the deletion if the backend refuses.
    pub fn remove(&self, path: &Path) -> Result<Completion> {
        clear_marker(&marker(path, MarkerKind::Move))?;
        let find = marker(path, MarkerKind::Find);
        if path.exists() {
            let delete = marker(path, MarkerKind::Delete);
            let outcome = match self.ops.remove_file(path) {
                Ok(()) => {
                    clear_marker(&delete)?;
                    Completion::Done
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "deferring delete");
                    write_op(
                        &delete,
                        &PendingOp::Delete {
                            path: path.to_path_buf(),
                        },
                    )?;
                    Completion::Deferred
                }
            };
            clear_marker(&find)?;
            return Ok(outcome);
        }
        if find.exists() {
            let real = self.find_target(&find)?;
            clear_marker(&find)?;
            if let Some(real) = real {
                return self.remove(&real);
            }
        }
        Ok(Completion::Absent)
    }

    /// Move `from` to `to` (different directories), or record the move.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<Completion> {
        if self.exists(to)? {
            return Err(surrogate_error(to, "refusing to rename onto an existing file"));
        }
        let mut source = from.to_path_buf();
        if !source.exists() {
            let find = marker(from, MarkerKind::Find);
            clear_marker(&marker(from, MarkerKind::Move))?;
            clear_marker(&marker(from, MarkerKind::Delete))?;
            let real = self.find_target(&find)?;
            clear_marker(&find)?;
            source = real.ok_or_else(|| surrogate_error(from, "cannot locate file to move"))?;
        }
        match self.ops.rename(&source, to) {
            Ok(()) => Ok(Completion::Done),
            Err(err) => {
                tracing::warn!(
                    from = %source.display(),
                    to = %to.display(),
                    error = %err,
                    "deferring rename"
                );
                let op = PendingOp::Move {
                    from: source.clone(),
                    to: to.to_path_buf(),
                };
                write_op(&marker(to, MarkerKind::Find), &op)?;
                write_op(&marker(&source, MarkerKind::Move), &op)?;
                for stray in [
                    marker(to, MarkerKind::Move),
                    marker(to, MarkerKind::Delete),
                    marker(&source, MarkerKind::Find),
                    marker(&source, MarkerKind::Delete),
                ] {
                    clear_marker(&stray)?;
                }
                Ok(Completion::Deferred)
            }
        }
    }

    /// Retry the moves and deletes recorded in `dir`. Returns how many completed.
    pub fn fix_pending(&self, dir: &Path) -> Result<usize> {
        let mut completed = 0;
        let mut names = Vec::new();
        for entry in fs_err::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        for name in names {
            let Some((kind, _)) = MarkerKind::split(&name) else {
                continue;
            };
            let marker_path = dir.join(&name);
            match (kind, read_op(&marker_path)?) {
                (MarkerKind::Find, _) => {}
                (MarkerKind::Delete, PendingOp::Delete { path }) => {
                    if !path.exists() {
                        clear_marker(&marker_path)?;
                    } else if self.ops.remove_file(&path).is_ok() {
                        clear_marker(&marker_path)?;
                        completed += 1;
                    }
                }
                (MarkerKind::Move, PendingOp::Move { from, to }) => {
                    if !from.exists() {
                        clear_marker(&marker_path)?;
                    } else if self.ops.rename(&from, &to).is_ok() {
                        clear_marker(&marker_path)?;
                        for kind in [MarkerKind::Find, MarkerKind::Move, MarkerKind::Delete] {
                            clear_marker(&marker(&to, kind))?;
                        }
                        completed += 1;
                    }
                }
                _ => {
                    return Err(surrogate_error(&marker_path, "marker kind and payload disagree"));
                }
            }
        }
        if completed > 0 {
            tracing::debug!(dir = %dir.display(), completed, "finished deferred operations");
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct RefusingOps;

    impl FileOps for RefusingOps {
        fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "rename refused"))
        }

        fn remove_file(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "unlink refused"))
        }
    }

    fn populate() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        for (name, body) in [("file1", "one"), ("file2", "two"), ("file3", "three")] {
            std::fs::write(a.join(name), body).unwrap();
        }
        (tmp, a, b)
    }

    fn read_through(s: &Surrogate, path: &Path) -> String {
        let real = s.resolve(path).unwrap().unwrap();
        std::fs::read_to_string(real).unwrap()
    }

    #[test]
    fn refused_operations_are_deferred_then_fixed() {
        let (_tmp, a, b) = populate();
        let refusing = Surrogate::new(RefusingOps);

        assert_eq!(
            refusing.rename(&a.join("file1"), &b.join("file1")).unwrap(),
            Completion::Deferred
        );
        assert!(refusing.exists(&b.join("file1")).unwrap());
        assert!(!refusing.exists(&a.join("file1")).unwrap());
        assert_eq!(read_through(&refusing, &b.join("file1")), "one");
        assert_eq!(refusing.list_dir(&a).unwrap(), vec!["file2", "file3"]);
        assert_eq!(refusing.list_dir(&b).unwrap(), vec!["file1"]);

        assert_eq!(
            refusing.remove(&a.join("file2")).unwrap(),
            Completion::Deferred
        );
        assert!(!refusing.exists(&a.join("file2")).unwrap());
        assert_eq!(refusing.resolve(&a.join("file2")).unwrap(), None);
        assert_eq!(refusing.list_dir(&a).unwrap(), vec!["file3"]);

        // Retrying with a refusing backend changes nothing.
        assert_eq!(refusing.fix_pending(&a).unwrap(), 0);

        let os = Surrogate::default();
        assert_eq!(os.fix_pending(&a).unwrap(), 2);
        assert_eq!(os.fix_pending(&a).unwrap(), 0);
        assert!(!a.join("file2").exists());
        assert_eq!(std::fs::read_to_string(b.join("file1")).unwrap(), "one");
        let raw: Vec<String> = std::fs::read_dir(&b)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(raw, vec!["file1"]);
        assert_eq!(os.list_dir(&a).unwrap(), vec!["file3"]);
    }

    #[test]
    fn removing_a_deferred_move_target_deletes_the_source() {
        let (_tmp, a, b) = populate();
        let refusing = Surrogate::new(RefusingOps);
        refusing.rename(&a.join("file3"), &b.join("file3")).unwrap();

        let os = Surrogate::default();
        assert_eq!(os.remove(&b.join("file3")).unwrap(), Completion::Done);
        assert!(!a.join("file3").exists());
        assert!(!os.exists(&b.join("file3")).unwrap());
        os.fix_pending(&a).unwrap();
        assert_eq!(os.list_dir(&a).unwrap(), vec!["file1", "file2"]);
    }

    #[test]
    fn rename_refuses_to_overwrite() {
        let (_tmp, a, _b) = populate();
        let os = Surrogate::default();
        let err = os.rename(&a.join("file1"), &a.join("file2")).unwrap_err();
        assert!(matches!(err, FramedexError::Surrogate { .. }));
        assert_eq!(os.remove(&a.join("missing")).unwrap(), Completion::Absent);
    }
}
