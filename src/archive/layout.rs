//! Directory layout of a layered archive.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{FramedexError, Result};

/// Archive levels, newest data first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Undecided,
    Recent,
    Transient,
    Base,
}

/// Lifecycle areas inside a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Area {
    Prepared,
    Waiting,
    Active,
    Retired,
}

impl Level {
    pub const ALL: [Self; 4] = [Self::Undecided, Self::Recent, Self::Transient, Self::Base];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Undecided => "undecided",
            Self::Recent => "recent",
            Self::Transient => "transient",
            Self::Base => "base",
        }
    }

    pub fn areas(self) -> &'static [Area] {
        match self {
            Self::Undecided => &[Area::Active, Area::Retired],
            Self::Recent => &[Area::Prepared, Area::Waiting, Area::Active, Area::Retired],
            Self::Transient | Self::Base => &[Area::Prepared, Area::Active, Area::Retired],
        }
    }

    pub fn has_area(self, area: Area) -> bool {
        self.areas().contains(&area)
    }
}

impl Area {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Paths of one archive directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, level: Level, area: Area) -> PathBuf {
        self.root.join(level.dir_name()).join(area.dir_name())
    }

    /// Every (level, area) pair in layout order.
    pub fn areas(&self) -> impl Iterator<Item = (Level, Area)> {
        Level::ALL
            .into_iter()
            .flat_map(|level| level.areas().iter().map(move |&area| (level, area)))
    }

    /// Create any missing directories.
    pub fn create_dirs(&self) -> Result<()> {
        for (level, area) in self.areas() {
            fs_err::create_dir_all(self.dir(level, area))?;
        }
        Ok(())
    }

    /// Fail unless every directory of the layout is present.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(FramedexError::layout(&self.root, "archive directory is missing"));
        }
        for (level, area) in self.areas() {
            let dir = self.dir(level, area);
            if !dir.is_dir() {
                return Err(FramedexError::layout(
                    &self.root,
                    format!("missing {level}/{area} directory"),
                ));
            }
        }
        Ok(())
    }
}
