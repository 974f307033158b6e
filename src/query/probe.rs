//! Index probes: key ranges over one index whose rows end in an identity.

use std::collections::BTreeSet;

use crate::archive::SessionMapping;
use crate::error::{FramedexError, Result};
use crate::session::IndexName;
use crate::types::{Key, Scalar};

/// A key range over one index. Every row inside it names a candidate identity
/// in its last key component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    index: IndexName,
    start: Key,
    end: Key,
    exact: bool,
}

/// Identities found by a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeHits {
    pub ids: BTreeSet<String>,
    /// The row limit was reached, so `ids` may be incomplete.
    pub truncated: bool,
}

impl Probe {
    /// Rows whose key starts with every component of `key`.
    pub fn matching(index: IndexName, key: Key) -> Self {
        let end = key.with(Scalar::Max);
        Self {
            index,
            start: key,
            end,
            exact: true,
        }
    }

    /// Rows whose key starts with `head` and then a text component beginning
    /// with `prefix`.
    pub fn prefix(index: IndexName, head: &Key, prefix: &str) -> Self {
        let end = match prefix_successor(prefix) {
            Some(next) => head.with(next),
            None => head.with(Scalar::Max),
        };
        Self {
            index,
            start: head.with(prefix),
            end,
            exact: true,
        }
    }

    /// Rows from `low` up to and including every row that starts with `high`.
    pub fn range(index: IndexName, low: Key, high: &Key) -> Result<Self> {
        if &low > high {
            return Err(FramedexError::invalid_query(format!(
                "bad range endpoints: {low} is after {high}"
            )));
        }
        Ok(Self {
            index,
            start: low,
            end: high.with(Scalar::Max),
            exact: true,
        })
    }

    /// Mark the probe as a superset of the filter it backs, so evaluation
    /// still tests its candidates.
    #[must_use]
    pub fn inexact(mut self) -> Self {
        self.exact = false;
        self
    }

    pub fn index(&self) -> IndexName {
        self.index
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> &Key {
        &self.end
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Approximate row count, from the index positions of both ends.
    pub fn estimate(&self, mapping: &SessionMapping) -> Result<u64> {
        let start = mapping.index_of(&self.start)?;
        let end = mapping.index_of(&self.end)?;
        Ok(end.saturating_sub(start))
    }

    /// Collect candidate identities, reading at most `limit` rows.
    pub fn evaluate(&self, mapping: &SessionMapping, limit: Option<usize>) -> Result<ProbeHits> {
        let rows = mapping.range_pairs(&self.start, &self.end, limit)?;
        let truncated = limit.is_some_and(|limit| rows.len() >= limit);
        let mut ids = BTreeSet::new();
        for (key, _) in rows {
            let Some(identity) = key.last().and_then(Scalar::as_text) else {
                return Err(FramedexError::corrupt(
                    mapping.archive().root(),
                    format!("{} row {key} does not end in an identity", self.index),
                ));
            };
            ids.insert(identity.to_owned());
        }
        Ok(ProbeHits { ids, truncated })
    }
}

/// The smallest string greater than every string starting with `prefix`, or
/// `None` when no such string exists (including the empty prefix).
pub(crate) fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = next_char(last) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn next_char(ch: char) -> Option<char> {
    let mut code = u32::from(ch) + 1;
    if (0xD800..0xE000).contains(&code) {
        code = 0xE000;
    }
    char::from_u32(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_successor_bumps_last_char() {
        assert_eq!(prefix_successor("fox").as_deref(), Some("foy"));
        assert_eq!(prefix_successor("a\u{10FFFF}").as_deref(), Some("b"));
        assert_eq!(prefix_successor("\u{D7FF}").as_deref(), Some("\u{E000}"));
        assert_eq!(prefix_successor(""), None);
        assert_eq!(prefix_successor("\u{10FFFF}"), None);
    }

    #[test]
    fn probe_bounds_cover_their_rows() {
        let head = Key::new(["title"]);
        let prefix = Probe::prefix(IndexName::AttrIndex, &head, "qu");
        let inside = Key::new(["title", "quick", "a"]);
        let outside = Key::new(["title", "r", "a"]);
        assert!(prefix.start() <= &inside && &inside < prefix.end());
        assert!(&outside >= prefix.end());

        let matching = Probe::matching(IndexName::AttrIndex, Key::new(["title", "quick"]));
        assert!(&inside < matching.end());
        assert!(&Key::new(["title", "quicker", "a"]) > matching.end());

        let range = Probe::range(
            IndexName::AttrIndex,
            Key::new(["year", "1990"]),
            &Key::new(["year", "1999"]),
        )
        .unwrap();
        assert!(&Key::new(["year", "1999", "z"]) < range.end());
        assert!(
            Probe::range(IndexName::AttrIndex, Key::new(["b"]), &Key::new(["a"])).is_err()
        );
    }
}
