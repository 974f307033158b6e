//! Document sessions over a directory of six layered archives.
//!
//! A [`Session`] decomposes entries into the relations below and keeps one
//! [`SessionMapping`] per archive:
//!
//! | Index | Rows |
//! |---|---|
//! | `System` | `(opcode, subkey) -> directive` (the attribute catalog) |
//! | `Description` | `(id, attr, value) -> true` |
//! | `Log` | `(micros, id) -> ()` |
//! | `AttrIndex` | `(attr, value prefix, id) -> true` |
//! | `AttrWord` | `(attr, word, id) -> true` |
//! | `WordIndex` | `(word, id) -> true` |

mod catalog;
mod lifecycle;
mod maintenance;
mod mutation;
mod search;

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

pub use catalog::{AttributeCatalog, Directive};
pub use lifecycle::{ancestor_chain, parent, special_value};

use crate::archive::{LayeredArchive, SessionMapping};
use crate::error::FramedexError;
use crate::types::SessionOptions;

/// The archives making up a session directory, in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexName {
    System,
    Description,
    Log,
    AttrIndex,
    AttrWord,
    WordIndex,
}

impl IndexName {
    pub const ALL: [IndexName; 6] = [
        Self::System,
        Self::Description,
        Self::Log,
        Self::AttrIndex,
        Self::AttrWord,
        Self::WordIndex,
    ];

    pub(crate) fn slot(self) -> usize {
        self as usize
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::Description => "Description",
            Self::Log => "Log",
            Self::AttrIndex => "AttrIndex",
            Self::AttrWord => "AttrWord",
            Self::WordIndex => "WordIndex",
        }
    }

    pub fn from_dir_name(name: &str) -> Result<Self, FramedexError> {
        Self::ALL
            .into_iter()
            .find(|index| index.dir_name() == name)
            .ok_or_else(|| FramedexError::UnknownIndex {
                name: name.to_owned(),
            })
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for IndexName {
    type Err = FramedexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_dir_name(s)
    }
}

/// An open document collection.
///
/// Sessions are single-threaded; several sessions, in one process or many,
/// may work on the same directory at once.
pub struct Session {
    root: PathBuf,
    session_id: String,
    options: SessionOptions,
    archives: Vec<Rc<LayeredArchive>>,
    mappings: Vec<SessionMapping>,
    catalog: AttributeCatalog,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.root)
            .field("session_id", &self.session_id)
            .field("read_only", &self.options.read_only)
            .field("threaded", &self.options.threaded)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn is_threaded(&self) -> bool {
        self.options.threaded
    }

    pub fn catalog(&self) -> &AttributeCatalog {
        &self.catalog
    }

    pub fn mapping(&self, index: IndexName) -> &SessionMapping {
        &self.mappings[index.slot()]
    }

    pub(crate) fn mapping_mut(&mut self, index: IndexName) -> &mut SessionMapping {
        &mut self.mappings[index.slot()]
    }

    pub fn archive(&self, index: IndexName) -> &LayeredArchive {
        &self.archives[index.slot()]
    }

    fn writable(&self) -> crate::Result<()> {
        if self.is_read_only() {
            Err(FramedexError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_round_trip() {
        for index in IndexName::ALL {
            assert_eq!(index.dir_name().parse::<IndexName>().unwrap(), index);
            assert_eq!(IndexName::ALL[index.slot()], index);
        }
        assert!(matches!(
            "Nope".parse::<IndexName>(),
            Err(FramedexError::UnknownIndex { .. })
        ));
    }
}
