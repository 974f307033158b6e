//! Committing session changes and compacting the archives.

use super::{AttributeCatalog, IndexName, Session};
use crate::archive::AggregateOutcome;
use crate::error::Result;

fn targets(target: Option<IndexName>) -> Vec<IndexName> {
    match target {
        Some(index) => vec![index],
        None => IndexName::ALL.to_vec(),
    }
}

impl Session {
    /// Write every uncommitted buffer to disk without publishing it. A later
    /// session opened with the same id resumes from there.
    pub fn sync(&mut self) -> Result<()> {
        for mapping in &mut self.mappings {
            mapping.sync()?;
        }
        Ok(())
    }

    /// Publish uncommitted changes. With `lazy` (default: the session's
    /// `lazy_store` option) the changes stay private to this session until
    /// the next aggregation. The System index is always published eagerly.
    pub fn store(&mut self, lazy: Option<bool>) -> Result<()> {
        let lazy = lazy.unwrap_or(self.options.lazy_store);
        self.mapping_mut(IndexName::System).store(false)?;
        for index in IndexName::ALL {
            if index != IndexName::System {
                self.mapping_mut(index).store(lazy)?;
            }
        }
        tracing::info!(session = %self.session_id, lazy, "session stored");
        Ok(())
    }

    /// Drop uncommitted changes in every index.
    pub fn discard(&mut self) -> Result<()> {
        for mapping in &mut self.mappings {
            mapping.discard()?;
        }
        self.catalog = AttributeCatalog::load(self.mapping(IndexName::System))?;
        tracing::info!(session = %self.session_id, "session discarded");
        Ok(())
    }

    /// Rebuild every view from the files now in the archives, keeping this
    /// session's uncommitted changes.
    pub fn refresh(&mut self) -> Result<()> {
        for mapping in &mut self.mappings {
            mapping.sync()?;
            mapping.reload()?;
        }
        self.catalog = AttributeCatalog::load(self.mapping(IndexName::System))?;
        Ok(())
    }

    /// Fold published changes into the transient trees, of one index or of
    /// all of them. Stops at the first index whose lock is held elsewhere
    /// (or fails, with `die_on_failure`).
    pub fn aggregate(
        &mut self,
        target: Option<IndexName>,
        die_on_failure: bool,
    ) -> Result<AggregateOutcome> {
        let auto_clean = self.catalog.auto_clean();
        let mut total = AggregateOutcome {
            locked: true,
            moved: 0,
        };
        for index in targets(target) {
            let archive = self.archive(index);
            let outcome = archive.aggregate(die_on_failure);
            if auto_clean && !archive.options().auto_clean {
                archive.clean_up(true)?;
            }
            let outcome = outcome?;
            total.moved += outcome.moved;
            if !outcome.locked {
                total.locked = false;
                break;
            }
        }
        tracing::info!(
            session = %self.session_id,
            moved = total.moved,
            locked = total.locked,
            "aggregation finished"
        );
        self.refresh()?;
        Ok(total)
    }

    /// Fold the transient trees into the base trees.
    pub fn move_to_base(
        &mut self,
        target: Option<IndexName>,
        die_on_failure: bool,
    ) -> Result<AggregateOutcome> {
        let mut total = AggregateOutcome {
            locked: true,
            moved: 0,
        };
        for index in targets(target) {
            let outcome = self.archive(index).move_to_base(die_on_failure)?;
            total.moved += outcome.moved;
            if !outcome.locked {
                total.locked = false;
                break;
            }
        }
        tracing::info!(
            session = %self.session_id,
            moved = total.moved,
            locked = total.locked,
            "move to base finished"
        );
        self.refresh()?;
        Ok(total)
    }

    /// Delete retired files (and, when `complete`, abandoned prepared files).
    /// Returns the number of files deleted.
    pub fn clean_up(&mut self, complete: bool, target: Option<IndexName>) -> Result<usize> {
        let mut removed = 0;
        for index in targets(target) {
            removed += self.archive(index).clean_up(complete)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::SessionOptions;

    #[test]
    fn compaction_keeps_content_visible() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        session
            .index_document("a", [("text".to_owned(), "quick fox".into())].into())
            .unwrap();
        session.store(Some(true)).unwrap();
        let before = session.describe("a").unwrap();
        assert!(before.is_some());

        let aggregated = session.aggregate(None, true).unwrap();
        assert!(aggregated.locked);
        assert!(aggregated.moved > 0);
        assert_eq!(session.describe("a").unwrap(), before);

        let moved = session.move_to_base(Some(IndexName::Description), true).unwrap();
        assert!(moved.locked);
        assert_eq!(session.describe("a").unwrap(), before);
        assert!(session.clean_up(true, None).unwrap() > 0);
        assert_eq!(session.query("fox").unwrap().identities().unwrap(), vec!["a"]);
    }

    #[test]
    fn lazy_store_is_private_until_aggregation() {
        let dir = TempDir::new().unwrap();
        let mut writer = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        writer
            .index_document("a", [("text".to_owned(), "quick".into())].into())
            .unwrap();
        writer.store(Some(true)).unwrap();

        let reader = Session::open(dir.path(), None, SessionOptions::default()).unwrap();
        assert!(reader.describe("a").unwrap().is_none());
        assert!(writer.describe("a").unwrap().is_some());

        writer.aggregate(None, true).unwrap();
        let reader = Session::open(dir.path(), None, SessionOptions::default()).unwrap();
        assert!(reader.describe("a").unwrap().is_some());
    }

    #[test]
    fn synced_changes_survive_reopening_the_session() {
        let dir = TempDir::new().unwrap();
        let mut first = Session::create(dir.path(), Some("s1"), SessionOptions::default()).unwrap();
        first
            .index_document("a", [("text".to_owned(), "quick".into())].into())
            .unwrap();
        first.sync().unwrap();
        drop(first);

        let mut resumed = Session::open(dir.path(), Some("s1"), SessionOptions::default()).unwrap();
        assert!(resumed.describe("a").unwrap().is_some());
        resumed.discard().unwrap();
        assert!(resumed.describe("a").unwrap().is_none());
    }
}
