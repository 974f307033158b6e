//! Evaluated query results: an identity set, a description cache and a
//! completeness flag.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

use crate::error::{FramedexError, Result};
use crate::session::{Session, ancestor_chain};
use crate::types::Entry;

/// Whether every candidate was examined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EvaluationStatus {
    #[default]
    Complete,
    /// A probe hit its size cap or the time limit ran out; the ids are a
    /// subset of the true answer.
    Truncated,
}

impl EvaluationStatus {
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        if self == Self::Truncated || other == Self::Truncated {
            Self::Truncated
        } else {
            Self::Complete
        }
    }

    pub fn is_truncated(self) -> bool {
        self == Self::Truncated
    }
}

pub struct QueryResult<'s> {
    session: &'s Session,
    threaded: bool,
    /// `None` until some filter restricts the result.
    ids: Option<BTreeSet<String>>,
    descriptions: RefCell<BTreeMap<String, Entry>>,
    status: EvaluationStatus,
}

impl std::fmt::Debug for QueryResult<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("threaded", &self.threaded)
            .field("ids", &self.ids)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<'s> QueryResult<'s> {
    pub(crate) fn unpopulated(session: &'s Session, threaded: bool) -> Self {
        Self {
            session,
            threaded,
            ids: None,
            descriptions: RefCell::new(BTreeMap::new()),
            status: EvaluationStatus::Complete,
        }
    }

    pub fn is_populated(&self) -> bool {
        self.ids.is_some()
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    pub fn status(&self) -> EvaluationStatus {
        self.status
    }

    pub fn is_truncated(&self) -> bool {
        self.status.is_truncated()
    }

    pub fn mark_truncated(&mut self) {
        self.status = EvaluationStatus::Truncated;
    }

    /// Number of ids held, before threaded suppression.
    pub fn len(&self) -> usize {
        self.ids.as_ref().map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.ids.as_ref().is_some_and(|ids| ids.contains(identity))
    }

    fn populated(&self) -> Result<&BTreeSet<String>> {
        self.ids
            .as_ref()
            .ok_or_else(|| FramedexError::invalid_query("result not yet populated"))
    }

    /// True when `identity`, or under threading any of its ancestors, is in `ids`.
    fn covered_by(&self, identity: &str, ids: &BTreeSet<String>) -> bool {
        if self.threaded {
            ancestor_chain(identity).iter().any(|a| ids.contains(*a))
        } else {
            ids.contains(identity)
        }
    }

    fn forget_descriptions(&mut self) {
        if let Some(ids) = &self.ids {
            self.descriptions
                .get_mut()
                .retain(|id, _| ids.contains(id));
        }
    }

    /// Restrict to `ids`. A threaded result keeps an id whose ancestor is in `ids`.
    pub(crate) fn intersect_ids(&mut self, ids: BTreeSet<String>) {
        let kept = match self.ids.take() {
            None => ids,
            Some(current) => current
                .into_iter()
                .filter(|id| self.covered_by(id, &ids))
                .collect(),
        };
        self.ids = Some(kept);
        self.forget_descriptions();
    }

    /// Replace the id set and cache with evaluated entries.
    pub(crate) fn reset(&mut self, entries: BTreeMap<String, Entry>) {
        self.ids = Some(entries.keys().cloned().collect());
        *self.descriptions.get_mut() = entries;
    }

    /// Intersect with another result. An unpopulated `other` restricts nothing.
    pub fn intersect(&mut self, other: QueryResult<'s>) {
        self.status = self.status.combine(other.status);
        let Some(ids) = other.ids else {
            return;
        };
        let cached = other.descriptions.into_inner();
        self.intersect_ids(ids);
        let mut descriptions = self.descriptions.borrow_mut();
        for (id, entry) in cached {
            if self.ids.as_ref().is_some_and(|ids| ids.contains(&id)) {
                descriptions.entry(id).or_insert(entry);
            }
        }
    }

    /// Add every id of `other`. An unpopulated side makes the union unrestricted.
    pub fn union(&mut self, other: QueryResult<'s>) {
        self.status = self.status.combine(other.status);
        let (Some(mine), Some(theirs)) = (self.ids.as_mut(), other.ids) else {
            self.ids = None;
            self.descriptions.get_mut().clear();
            return;
        };
        mine.extend(theirs);
        let mut descriptions = self.descriptions.borrow_mut();
        for (id, entry) in other.descriptions.into_inner() {
            descriptions.entry(id).or_insert(entry);
        }
    }

    /// Remove every id matched by `other`.
    pub fn difference(&mut self, other: &QueryResult<'s>) -> Result<()> {
        if self.ids.is_none() {
            return Err(FramedexError::invalid_query("unrestricted negation"));
        }
        self.status = self.status.combine(other.status);
        let Some(excluded) = &other.ids else {
            self.ids = Some(BTreeSet::new());
            self.forget_descriptions();
            return Ok(());
        };
        let kept = self
            .ids
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !self.covered_by(id, excluded))
            .collect();
        self.ids = Some(kept);
        self.forget_descriptions();
        Ok(())
    }

    /// Result identities in ascending order. A threaded result omits ids
    /// whose ancestor is also present.
    pub fn identities(&self) -> Result<Vec<String>> {
        let ids = self.populated()?;
        Ok(ids
            .iter()
            .filter(|id| {
                !self.threaded
                    || !ancestor_chain(id)
                        .iter()
                        .skip(1)
                        .any(|ancestor| ids.contains(*ancestor))
            })
            .cloned()
            .collect())
    }

    /// Every id, without threaded suppression.
    pub fn all_identities(&self) -> Result<Vec<String>> {
        Ok(self.populated()?.iter().cloned().collect())
    }

    /// Description of a result id, cached after the first read.
    pub fn describe(&self, identity: &str) -> Result<Entry> {
        if !self.populated()?.contains(identity) {
            return Err(FramedexError::invalid_query(format!(
                "id not in result set: {identity}"
            )));
        }
        self.describe_any(identity)
    }

    fn describe_any(&self, identity: &str) -> Result<Entry> {
        if let Some(entry) = self.descriptions.borrow().get(identity) {
            return Ok(entry.clone());
        }
        let entry = self
            .session
            .describe(identity)?
            .unwrap_or_else(|| Entry::new(identity));
        self.descriptions
            .borrow_mut()
            .insert(identity.to_owned(), entry.clone());
        Ok(entry)
    }

    /// Descriptions of `identity` followed by its parent, grandparent and so on.
    pub fn describe_thread(&self, identity: &str) -> Result<Vec<Entry>> {
        ancestor_chain(identity)
            .into_iter()
            .map(|id| self.describe_any(id))
            .collect()
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.identities()?
            .iter()
            .map(|id| self.describe(id))
            .collect()
    }

    pub fn dictionaries(&self) -> Result<Vec<BTreeMap<String, String>>> {
        self.entries()?
            .iter()
            .map(|entry| entry.as_dictionary(false))
            .collect()
    }

    /// Take an identity out of the result.
    pub fn remove(&mut self, identity: &str) {
        if let Some(ids) = &mut self.ids {
            ids.remove(identity);
        }
        self.descriptions.get_mut().remove(identity);
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 3);
        writer.write_event(Event::Start(BytesStart::new("entries")))?;
        for id in self.identities()? {
            self.describe(&id)?.write_xml(&mut writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new("entries")))?;
        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|err| FramedexError::invalid_entry(format!("xml is not utf-8: {err}")))
    }

    /// Consume the result into a lazy iterator of descriptions.
    pub fn into_entries(self) -> Result<QueryEntries<'s>> {
        let ids = self.identities()?;
        Ok(QueryEntries {
            session: self.session,
            ids: ids.into_iter(),
            cached: self.descriptions.into_inner(),
            status: self.status,
        })
    }
}

/// Lazily described entries of a result, in identity order.
pub struct QueryEntries<'s> {
    session: &'s Session,
    ids: std::vec::IntoIter<String>,
    cached: BTreeMap<String, Entry>,
    status: EvaluationStatus,
}

impl QueryEntries<'_> {
    pub fn status(&self) -> EvaluationStatus {
        self.status
    }
}

impl Iterator for QueryEntries<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        if let Some(entry) = self.cached.remove(&id) {
            return Some(Ok(entry));
        }
        Some(
            self.session
                .describe(&id)
                .map(|found| found.unwrap_or_else(|| Entry::new(id))),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::SessionOptions;

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn threaded_result_suppresses_descendants() {
        let dir = TempDir::new().unwrap();
        let session =
            Session::create(dir.path(), None, SessionOptions::default().threaded(true)).unwrap();
        let mut result = QueryResult::unpopulated(&session, true);
        result.intersect_ids(ids(&["a", "r\\a", "q"]));
        assert_eq!(result.identities().unwrap(), vec!["a", "q"]);
        assert_eq!(result.all_identities().unwrap().len(), 3);

        // A reply survives an intersection its parent passes.
        result.intersect_ids(ids(&["a"]));
        assert_eq!(result.all_identities().unwrap(), vec!["a", "r\\a"]);
    }

    #[test]
    fn difference_requires_a_restricted_result() {
        let dir = TempDir::new().unwrap();
        let session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        let excluded = {
            let mut r = QueryResult::unpopulated(&session, false);
            r.intersect_ids(ids(&["b"]));
            r
        };
        let mut open = QueryResult::unpopulated(&session, false);
        assert!(open.difference(&excluded).is_err());

        let mut result = QueryResult::unpopulated(&session, false);
        result.intersect_ids(ids(&["a", "b"]));
        result.difference(&excluded).unwrap();
        assert_eq!(result.identities().unwrap(), vec!["a"]);
        assert!(result.describe("b").is_err());
        assert_eq!(result.describe("a").unwrap().identity(), "a");
    }

    #[test]
    fn statuses_combine() {
        use EvaluationStatus::*;
        assert_eq!(Complete.combine(Complete), Complete);
        assert_eq!(Complete.combine(Truncated), Truncated);
        assert_eq!(Truncated.combine(Complete), Truncated);
    }
}
