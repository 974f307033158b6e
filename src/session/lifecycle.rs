//! Creating and opening session directories, plus identity helpers.

use std::path::Path;
use std::rc::Rc;

use super::{AttributeCatalog, IndexName, Session};
use crate::archive::{LayeredArchive, SessionMapping};
use crate::constants::THREAD_SEPARATOR;
use crate::error::{FramedexError, Result};
use crate::io::naming;
use crate::types::{SessionOptions, SpecialKind, SpecialValue};

impl Session {
    /// Create a collection in `root`, which must be missing or empty.
    pub fn create<P: AsRef<Path>>(
        root: P,
        session_id: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self> {
        let root = root.as_ref();
        fs_err::create_dir_all(root)?;
        if fs_err::read_dir(root)?.next().is_some() {
            return Err(FramedexError::layout(
                root,
                "cannot create a collection in a non-empty directory",
            ));
        }
        for index in IndexName::ALL {
            LayeredArchive::create(root.join(index.dir_name()), options.archive)?;
        }
        tracing::info!(root = %root.display(), "collection created");
        Self::open(root, session_id, options)
    }

    /// Open an existing collection. Without a session id a fresh one is made,
    /// so uncommitted work of earlier sessions stays separate.
    pub fn open<P: AsRef<Path>>(
        root: P,
        session_id: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self> {
        let root = root.as_ref();
        let session_id = session_id.map_or_else(naming::session_id, str::to_owned);
        let mut archives = Vec::with_capacity(IndexName::ALL.len());
        let mut mappings = Vec::with_capacity(IndexName::ALL.len());
        for index in IndexName::ALL {
            let archive = Rc::new(LayeredArchive::open(
                root.join(index.dir_name()),
                options.archive,
            )?);
            mappings.push(SessionMapping::open(
                Rc::clone(&archive),
                &session_id,
                options.read_only,
            )?);
            archives.push(archive);
        }
        let catalog = AttributeCatalog::load(&mappings[IndexName::System.slot()])?;
        tracing::info!(
            root = %root.display(),
            session = %session_id,
            read_only = options.read_only,
            threaded = options.threaded,
            "session opened"
        );
        Ok(Self {
            root: root.to_path_buf(),
            session_id,
            options,
            archives,
            mappings,
            catalog,
        })
    }

    pub fn open_or_create<P: AsRef<Path>>(
        root: P,
        session_id: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self> {
        let root = root.as_ref();
        if root.join(IndexName::System.dir_name()).is_dir() {
            Self::open(root, session_id, options)
        } else {
            Self::create(root, session_id, options)
        }
    }

    /// The identity itself followed by each ancestor.
    pub fn ancestor_chain<'a>(&self, identity: &'a str) -> Vec<&'a str> {
        ancestor_chain(identity)
    }

    pub fn parent<'a>(&self, identity: &'a str) -> Option<&'a str> {
        parent(identity)
    }
}

/// The identity followed by each shorter suffix after a separator:
/// `c\b\a` gives `c\b\a`, `b\a`, `a`.
pub fn ancestor_chain(identity: &str) -> Vec<&str> {
    let mut chain = vec![identity];
    let mut rest = identity;
    while let Some(parent) = parent(rest) {
        chain.push(parent);
        rest = parent;
    }
    chain
}

/// The identity with its first component dropped, if it has more than one.
pub fn parent(identity: &str) -> Option<&str> {
    identity
        .split_once(THREAD_SEPARATOR)
        .map(|(_, rest)| rest)
}

/// Build a special value from its flag name.
pub fn special_value(flag_name: &str, text: &str) -> Result<SpecialValue> {
    let kind = SpecialKind::from_flag_name(flag_name).ok_or_else(|| {
        FramedexError::invalid_entry(format!("unknown special value flag {flag_name:?}"))
    })?;
    Ok(SpecialValue::new(kind, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ancestry_follows_separators() {
        assert_eq!(ancestor_chain("c\\b\\a"), vec!["c\\b\\a", "b\\a", "a"]);
        assert_eq!(ancestor_chain("a"), vec!["a"]);
        assert_eq!(parent("r\\a"), Some("a"));
        assert_eq!(parent("a"), None);
    }

    #[test]
    fn special_values_by_flag_name() {
        let value = special_value("ImageURL", "http://x/y.png").unwrap();
        assert_eq!(value.kind, SpecialKind::ImageUrl);
        assert!(special_value("Bogus", "x").is_err());
    }

    #[test]
    fn create_requires_an_empty_directory() {
        let dir = TempDir::new().unwrap();
        fs_err::write(dir.path().join("stray"), b"x").unwrap();
        let err = Session::create(dir.path(), None, SessionOptions::default()).unwrap_err();
        assert!(matches!(err, FramedexError::InvalidLayout { .. }));
    }

    #[test]
    fn open_or_create_reuses_a_collection() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("coll");
        let session = Session::open_or_create(&root, Some("one"), SessionOptions::default()).unwrap();
        assert_eq!(session.session_id(), "one");
        drop(session);
        let again = Session::open_or_create(&root, None, SessionOptions::default()).unwrap();
        assert_ne!(again.session_id(), "one");
        for index in IndexName::ALL {
            assert!(root.join(index.dir_name()).is_dir());
        }
    }
}
