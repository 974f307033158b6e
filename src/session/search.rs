//! Reading entries back and building queries.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{IndexName, Session};
use crate::constants::VALUE_TRUNCATION;
use crate::error::{FramedexError, Result};
use crate::frames::codec::decode;
use crate::query::{Filter, Probe, Query, QueryEntries, QueryResult, Test, boolean_result};
use crate::text::normalize_word;
use crate::types::entry::xml_attribute;
use crate::types::{AttrValue, Entry, Key, Scalar};

fn identity_of(key: &Key) -> Option<String> {
    key.first().and_then(Scalar::as_text).map(str::to_owned)
}

fn truncated(text: &str) -> (String, bool) {
    let count = text.chars().count();
    (text.chars().take(VALUE_TRUNCATION).collect(), count >= VALUE_TRUNCATION)
}

fn required_attribute(element: &BytesStart<'_>, tag: &str, name: &str) -> Result<String> {
    match xml_attribute(element, name.as_bytes())? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(FramedexError::invalid_query(format!(
            "<{tag}> requires a non-empty {name} attribute"
        ))),
    }
}

impl Session {
    /// Reassemble an entry from its Description rows.
    pub fn describe(&self, identity: &str) -> Result<Option<Entry>> {
        let low = Key::new([identity]);
        let high = low.with(Scalar::Max);
        let mapping = self.mapping(IndexName::Description);
        let rows = mapping.range_pairs(&low, &high, None)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut entry = Entry::new(identity);
        for (key, _) in rows {
            let (Some(Scalar::Text(attr)), Some(Scalar::Bytes(bytes))) = (key.get(1), key.get(2))
            else {
                return Err(FramedexError::corrupt(
                    mapping.archive().root(),
                    format!("malformed description row {key}"),
                ));
            };
            let value: AttrValue = decode(bytes)?;
            entry.add_value(self.catalog.untranslate(attr), value);
        }
        Ok(Some(entry))
    }

    pub fn first_id(&self) -> Result<Option<String>> {
        Ok(self
            .mapping(IndexName::Description)
            .first()?
            .and_then(|(key, _)| identity_of(&key)))
    }

    /// The described identity following `last`.
    pub fn next_id(&self, last: &str) -> Result<Option<String>> {
        let after = Key::new([last]).with(Scalar::Max);
        Ok(self
            .mapping(IndexName::Description)
            .next_after(&after)?
            .and_then(|(key, _)| identity_of(&key)))
    }

    /// Every described identity in order, up to `limit`. Meant for tests and
    /// small collections.
    pub fn all_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut next = self.first_id()?;
        while let Some(id) = next {
            if limit.is_some_and(|limit| ids.len() >= limit) {
                break;
            }
            next = self.next_id(&id)?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn has_identity(&self, identity: &str) -> Result<bool> {
        let probe = Key::new([identity]);
        Ok(self
            .mapping(IndexName::Description)
            .at_or_next(&probe, false)?
            .is_some_and(|(key, _)| key.first().and_then(Scalar::as_text) == Some(identity)))
    }

    /// Entries with `value` for `attr`. Values are indexed by their first
    /// characters only, so a long value probes inexactly.
    pub fn attribute_match_filter(&self, attr: &str, value: &str) -> Filter {
        let test = Test::Match {
            attr: attr.to_owned(),
            value: value.to_owned(),
        };
        if self.catalog.is_free_text_only() {
            return Filter::tested(test);
        }
        let (cut, inexact) = truncated(value);
        let probe = Probe::matching(
            IndexName::AttrIndex,
            Key::new([self.catalog.translate(attr), cut.as_str()]),
        );
        Filter::new(Some(if inexact { probe.inexact() } else { probe }), test)
    }

    pub fn attribute_prefix_filter(&self, attr: &str, prefix: &str) -> Filter {
        let test = Test::Prefix {
            attr: attr.to_owned(),
            prefix: prefix.to_owned(),
        };
        if self.catalog.is_free_text_only() {
            return Filter::tested(test);
        }
        let (cut, _) = truncated(prefix);
        let inexact = prefix.chars().count() > VALUE_TRUNCATION;
        let head = Key::new([self.catalog.translate(attr)]);
        let probe = Probe::prefix(IndexName::AttrIndex, &head, &cut);
        Filter::new(Some(if inexact { probe.inexact() } else { probe }), test)
    }

    /// Entries with a value of `attr` in `low..=high`.
    pub fn attribute_range_filter(&self, attr: &str, low: &str, high: &str) -> Result<Filter> {
        if low > high {
            return Err(FramedexError::invalid_query(format!(
                "bad range endpoints: {low:?} is after {high:?}"
            )));
        }
        let test = Test::Range {
            attr: attr.to_owned(),
            low: low.to_owned(),
            high: high.to_owned(),
        };
        if self.catalog.is_free_text_only() {
            return Ok(Filter::tested(test));
        }
        let stored = self.catalog.translate(attr);
        let (low_cut, low_inexact) = truncated(low);
        let (high_cut, high_inexact) = truncated(high);
        let probe = Probe::range(
            IndexName::AttrIndex,
            Key::new([stored, low_cut.as_str()]),
            &Key::new([stored, high_cut.as_str()]),
        )?;
        let probe = if low_inexact || high_inexact {
            probe.inexact()
        } else {
            probe
        };
        Ok(Filter::new(Some(probe), test))
    }

    /// Entries where some word of `attr` starts with `word`.
    pub fn attribute_word_filter(&self, attr: &str, word: &str) -> Result<Filter> {
        if self.catalog.is_free_text_only() {
            return Err(FramedexError::invalid_query(format!(
                "attribute indexing is disabled, cannot search {attr}:{word}"
            )));
        }
        let word = normalize_word(word);
        let head = Key::new([self.catalog.translate(attr)]);
        let probe = Probe::prefix(IndexName::AttrWord, &head, &word);
        Ok(Filter::new(
            Some(probe),
            Test::AttrWord {
                attr: attr.to_owned(),
                word,
            },
        ))
    }

    /// Entries where some word of any attribute starts with `word`.
    pub fn word_filter(&self, word: &str) -> Filter {
        let word = normalize_word(word);
        let probe = Probe::prefix(IndexName::WordIndex, &Key::default(), &word);
        Filter::new(Some(probe), Test::AnyWord { word })
    }

    /// Words in order within one value. No index supports this filter.
    pub fn proximate_filter(&self, words: Vec<String>, limit: usize) -> Filter {
        let words = words.iter().map(|w| normalize_word(w)).collect();
        Filter::tested(Test::Proximate {
            words,
            limit,
            proximity: self.options.query.proximity,
        })
    }

    pub fn new_query(&self) -> Query<'_> {
        Query::new(self)
    }

    /// Build a query from its XML form:
    ///
    /// ```xml
    /// <query threaded="false">
    ///    <match n="year" v="1999"/>
    ///    <prefix n="title" p="qu"/>
    ///    <range n="year" low="1990" high="1999"/>
    ///    <contains n="title" p="fox"/>
    ///    <near limit="2" words="quick fox"/>
    /// </query>
    /// ```
    ///
    /// `contains` without `n` matches any attribute. Unknown elements are ignored.
    pub fn query_from_xml(&self, text: &str) -> Result<Query<'_>> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);
        let mut query: Option<Query<'_>> = None;
        loop {
            let element = match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => e,
                Event::Eof => break,
                _ => continue,
            };
            let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
            let Some(query) = query.as_mut() else {
                if tag != "query" {
                    return Err(FramedexError::invalid_query("query xml must start with <query>"));
                }
                let threaded = match xml_attribute(&element, b"threaded")? {
                    Some(flag) if !flag.trim().is_empty() => {
                        !flag.trim().eq_ignore_ascii_case("false")
                    }
                    _ => self.is_threaded(),
                };
                query = Some(Query::new(self).threaded(threaded));
                continue;
            };
            let required = |name: &str| required_attribute(&element, &tag, name);
            match tag.as_str() {
                "prefix" => {
                    query.prefix_attribute(&required("n")?, &required("p")?)?;
                }
                "range" => {
                    query.attribute_range(&required("n")?, &required("low")?, &required("high")?)?;
                }
                "contains" => {
                    let word = required("p")?;
                    match xml_attribute(&element, b"n")?.filter(|n| !n.is_empty()) {
                        Some(attr) => query.attribute_word(&attr, &word)?,
                        None => query.any_word(&word)?,
                    };
                }
                "match" => {
                    query.match_attribute(&required("n")?, &required("v")?)?;
                }
                "near" => {
                    let limit = required("limit")?;
                    let limit: usize = limit.trim().parse().map_err(|_| {
                        FramedexError::invalid_query(format!("near requires an integer limit, not {limit:?}"))
                    })?;
                    let words = required("words")?;
                    query.proximate_words(words.split_whitespace(), limit)?;
                }
                _ => {}
            }
        }
        query.ok_or_else(|| FramedexError::invalid_query("query xml must start with <query>"))
    }

    /// Evaluate a query string in the boolean query language.
    pub fn query(&self, text: &str) -> Result<QueryResult<'_>> {
        boolean_result(self, text)
    }

    /// Lazily described entries matching a query string.
    pub fn query_entries(&self, text: &str) -> Result<QueryEntries<'_>> {
        self.query(text)?.into_entries()
    }

    pub fn entries(&self, text: &str) -> Result<Vec<Entry>> {
        self.query(text)?.entries()
    }

    pub fn dictionaries(&self, text: &str) -> Result<Vec<BTreeMap<String, String>>> {
        self.query(text)?.dictionaries()
    }
}
