//! Indexing and removing entries.

use std::collections::{BTreeMap, BTreeSet};

use super::catalog::is_link_attribute;
use super::lifecycle::parent;
use super::{IndexName, Session};
use crate::constants::{CHILD_ATTRIBUTE, PARENT_ATTRIBUTE, SHORT_WORD_LENGTH, VALUE_TRUNCATION};
use crate::error::Result;
use crate::frames::codec::encode;
use crate::query::Indexable;
use crate::text::parse_words;
use crate::types::{AttrValue, Entry, Key, Scalar, Value};

/// Index rows derived from one entry.
#[derive(Debug, Default)]
struct Rows {
    description: BTreeSet<Key>,
    attr_index: BTreeSet<Key>,
    attr_word: BTreeSet<Key>,
    word_index: BTreeSet<Key>,
}

impl Rows {
    fn by_index(self) -> [(IndexName, BTreeSet<Key>); 4] {
        [
            (IndexName::Description, self.description),
            (IndexName::AttrIndex, self.attr_index),
            (IndexName::AttrWord, self.attr_word),
            (IndexName::WordIndex, self.word_index),
        ]
    }
}

fn truncated(text: &str) -> String {
    text.chars().take(VALUE_TRUNCATION).collect()
}

fn description_key(identity: &str, attr: &str, value: &AttrValue) -> Result<Key> {
    Ok(Key::from(vec![
        Scalar::text(identity),
        Scalar::text(attr),
        Scalar::Bytes(encode(value)?),
    ]))
}

impl Session {
    /// Text a value contributes to the indexes. Special values contribute the
    /// content of their (translated) target.
    pub fn indexable_text(&self, value: &AttrValue) -> String {
        match value.as_special() {
            Some(special) => special.content(&self.translate_url(&special.text)),
            None => value.display_text(),
        }
    }

    /// Indexable texts of every attribute, under the caller's attribute names.
    pub fn indexable(&self, entry: &Entry) -> Indexable {
        entry
            .attributes()
            .map(|(name, values)| {
                let texts = values.iter().map(|v| self.indexable_text(v)).collect();
                (name.to_owned(), texts)
            })
            .collect()
    }

    /// Attribute indexes are skipped in free-text-only collections, except
    /// when removing, where stale rows from before the switch must go too.
    fn decompose(&self, entry: &Entry, removing: bool) -> Result<Rows> {
        let identity = entry.identity();
        let with_attributes = removing || !self.catalog.is_free_text_only();
        let mut rows = Rows::default();
        for (name, values) in entry.attributes() {
            if is_link_attribute(name) {
                continue;
            }
            let attr = self.catalog.translate(name);
            for value in values {
                rows.description.insert(description_key(identity, attr, value)?);
                let text = self.indexable_text(value);
                if with_attributes {
                    rows.attr_index
                        .insert(Key::new([attr, truncated(&text).as_str(), identity]));
                }
                for word in parse_words(&text) {
                    if word.chars().count() <= SHORT_WORD_LENGTH {
                        continue;
                    }
                    if with_attributes {
                        rows.attr_word.insert(Key::new([attr, word.as_str(), identity]));
                    }
                    rows.word_index.insert(Key::new([word.as_str(), identity]));
                }
            }
        }
        if let Some(parent) = parent(identity) {
            if with_attributes {
                rows.attr_index
                    .insert(Key::new([CHILD_ATTRIBUTE, identity, parent]));
                rows.attr_index
                    .insert(Key::new([PARENT_ATTRIBUTE, parent, identity]));
            }
            rows.description.insert(description_key(
                identity,
                PARENT_ATTRIBUTE,
                &AttrValue::text(parent),
            )?);
        }
        Ok(rows)
    }

    /// Add an entry to every index. Changes become visible to other sessions
    /// after [`store`](Session::store).
    pub fn index(&mut self, entry: &Entry) -> Result<()> {
        self.writable()?;
        self.abbreviate_unknown(entry)?;
        let rows = self.decompose(entry, false)?;
        let mut written = 0usize;
        for (index, keys) in rows.by_index() {
            written += keys.len();
            let mapping = self.mapping_mut(index);
            for key in keys {
                mapping.put(key, Value::Flag(true))?;
            }
        }
        let stamp = chrono::Utc::now().timestamp_micros();
        self.mapping_mut(IndexName::Log).put(
            Key::from(vec![Scalar::Int(stamp), Scalar::text(entry.identity())]),
            Value::Unit,
        )?;
        tracing::debug!(identity = entry.identity(), rows = written, "entry indexed");
        Ok(())
    }

    /// Index single-valued attributes under `identity`.
    pub fn index_document(
        &mut self,
        identity: &str,
        attributes: BTreeMap<String, AttrValue>,
    ) -> Result<()> {
        let attributes = attributes
            .into_iter()
            .map(|(name, value)| (name, vec![value]))
            .collect();
        let entry = Entry::with_attributes(identity, attributes)?;
        self.index(&entry)
    }

    /// Remove every row recorded for `identity`. Returns false when the
    /// identity is not described.
    pub fn remove(&mut self, identity: &str) -> Result<bool> {
        self.writable()?;
        let Some(entry) = self.describe(identity)? else {
            return Ok(false);
        };
        let rows = self.decompose(&entry, true)?;
        for (index, keys) in rows.by_index() {
            let mapping = self.mapping_mut(index);
            for key in keys {
                mapping.delete(key)?;
            }
        }
        let low = Key::new([identity]);
        let high = low.with(Scalar::Max);
        let leftovers = self
            .mapping(IndexName::Description)
            .range_pairs(&low, &high, None)?;
        let description = self.mapping_mut(IndexName::Description);
        for (key, _) in leftovers {
            description.delete(key)?;
        }
        tracing::debug!(identity, "entry removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::{SessionOptions, SpecialKind, SpecialValue};

    #[test]
    fn entries_describe_as_indexed() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        let mut entry = Entry::new("doc");
        entry.add_value("title", "Fish & Chips");
        entry.add_value("title", "Second title");
        entry.add_value("year", 1999.0);
        entry.add_value("pic", SpecialValue::new(SpecialKind::ImageUrl, "p.png"));
        session.index(&entry).unwrap();

        assert_eq!(session.describe("doc").unwrap(), Some(entry));
        assert!(session.has_identity("doc").unwrap());
        assert!(session.describe("missing").unwrap().is_none());
    }

    #[test]
    fn children_link_to_parents() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        session
            .index_document("r\\a", [("text".to_owned(), "reply".into())].into())
            .unwrap();
        let reply = session.describe("r\\a").unwrap().unwrap();
        assert_eq!(reply.get(PARENT_ATTRIBUTE).as_deref(), Some("a"));
        let link = Key::new([CHILD_ATTRIBUTE, "r\\a", "a"]);
        assert!(session.mapping(IndexName::AttrIndex).has(&link).unwrap());
    }

    #[test]
    fn remove_clears_every_index() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        session
            .index_document("a", [("text".to_owned(), "quick brown fox".into())].into())
            .unwrap();
        session.store(None).unwrap();
        assert!(session.remove("a").unwrap());
        assert!(!session.remove("missing").unwrap());
        session.store(None).unwrap();

        assert!(session.describe("a").unwrap().is_none());
        for index in [IndexName::AttrIndex, IndexName::AttrWord, IndexName::WordIndex] {
            assert!(session.mapping(index).first().unwrap().is_none(), "{index}");
        }
        // The log keeps the history of indexing.
        assert!(session.mapping(IndexName::Log).first().unwrap().is_some());
    }

    #[test]
    fn free_text_only_skips_attribute_indexes() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        session.set_free_text_only(true).unwrap();
        session
            .index_document("a", [("text".to_owned(), "quick fox".into())].into())
            .unwrap();
        assert!(session.mapping(IndexName::AttrIndex).first().unwrap().is_none());
        assert!(session.mapping(IndexName::WordIndex).first().unwrap().is_some());
        assert!(session.attribute_word_filter("text", "fox").is_err());
    }
}
