//! Cost-ordered query evaluation.
//!
//! Filters with an index probe are evaluated cheapest first while their
//! estimates stay under a ceiling that tightens as the result shrinks. What
//! remains is checked entry by entry against the descriptions of the
//! surviving identities, within the time limit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use std::time::{Duration, Instant};

use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

use super::filter::{Annotations, Filter, Test};
use super::result::QueryResult;
use crate::constants::SUGGESTION_SAMPLE_WORDS;
use crate::error::{FramedexError, Result};
use crate::session::Session;
use crate::text::{Annotator, parse_words};
use crate::types::{Entry, QueryOptions};

/// Default marks used by [`Query::annotate_dictionary`].
pub const DEFAULT_DELIMITERS: (&str, &str) = ("<b><em>", "</em></b>");

/// Identifies a filter within a query. Adding the same key twice keeps one filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterKey {
    AttrWord { attr: String, word: String },
    Match { attr: String, value: String },
    Prefix { attr: String, prefix: String },
    Range { attr: String, low: String, high: String },
    AnyWord(String),
    Near(Vec<String>),
    Custom(String),
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttrWord { attr, word } => write!(f, "{attr}:{word}"),
            Self::Match { attr, value } => write!(f, "{attr}={value:?}"),
            Self::Prefix { attr, prefix } => write!(f, "{attr}={prefix:?}.."),
            Self::Range { attr, low, high } => write!(f, "{attr}=[{low:?}:{high:?}]"),
            Self::AnyWord(word) => f.write_str(word),
            Self::Near(words) => write!(f, "near({})", words.join("..")),
            Self::Custom(name) => write!(f, "custom({name})"),
        }
    }
}

/// Completion suggestions sampled from the entries a weakened query matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suggestions {
    /// Every sampled word.
    pub words: BTreeSet<String>,
    /// Sampled words per attribute.
    pub by_attribute: BTreeMap<String, BTreeSet<String>>,
}

pub struct Query<'s> {
    session: &'s Session,
    threaded: bool,
    options: QueryOptions,
    filters: BTreeMap<FilterKey, Filter>,
    log: Vec<String>,
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("threaded", &self.threaded)
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<'s> Query<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self {
            session,
            threaded: session.is_threaded(),
            options: session.options().query,
            filters: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn filters(&self) -> impl Iterator<Item = (&FilterKey, &Filter)> {
        self.filters.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn add(&mut self, key: FilterKey, filter: Filter) -> &mut Self {
        self.filters.insert(key, filter);
        self
    }

    pub fn match_attribute(&mut self, attr: &str, value: &str) -> Result<&mut Self> {
        let filter = self.session.attribute_match_filter(attr, value);
        let key = FilterKey::Match {
            attr: attr.to_owned(),
            value: value.to_owned(),
        };
        Ok(self.add(key, filter))
    }

    pub fn prefix_attribute(&mut self, attr: &str, prefix: &str) -> Result<&mut Self> {
        let filter = self.session.attribute_prefix_filter(attr, prefix);
        let key = FilterKey::Prefix {
            attr: attr.to_owned(),
            prefix: prefix.to_owned(),
        };
        Ok(self.add(key, filter))
    }

    pub fn attribute_range(&mut self, attr: &str, low: &str, high: &str) -> Result<&mut Self> {
        let filter = self.session.attribute_range_filter(attr, low, high)?;
        let key = FilterKey::Range {
            attr: attr.to_owned(),
            low: low.to_owned(),
            high: high.to_owned(),
        };
        Ok(self.add(key, filter))
    }

    /// One filter per word of `text`, each matching a word prefix within `attr`.
    pub fn attribute_word(&mut self, attr: &str, text: &str) -> Result<&mut Self> {
        for word in parse_words(text) {
            let filter = self.session.attribute_word_filter(attr, &word)?;
            let key = FilterKey::AttrWord {
                attr: attr.to_owned(),
                word,
            };
            self.add(key, filter);
        }
        Ok(self)
    }

    /// One filter per word of `text`, each matching a word prefix anywhere.
    pub fn any_word(&mut self, text: &str) -> Result<&mut Self> {
        for word in parse_words(text) {
            let filter = self.session.word_filter(&word);
            self.add(FilterKey::AnyWord(word), filter);
        }
        Ok(self)
    }

    /// Words in order within one value, each at most `limit` words after the
    /// previous one. Every word also becomes an any-word filter so that the
    /// indexes narrow the candidates.
    pub fn proximate_words<I, S>(&mut self, words: I, limit: usize) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words: Vec<String> = words
            .into_iter()
            .flat_map(|w| parse_words(w.as_ref()))
            .collect();
        if words.len() > 1 {
            let filter = self.session.proximate_filter(words.clone(), limit);
            self.add(FilterKey::Near(words.clone()), filter);
        }
        for word in &words {
            self.any_word(word)?;
        }
        Ok(self)
    }

    /// Add a caller-built filter under its own name.
    pub fn add_miscellaneous_filter(&mut self, name: &str, filter: Filter) -> Result<&mut Self> {
        let key = FilterKey::Custom(name.to_owned());
        if self.filters.contains_key(&key) {
            return Err(FramedexError::invalid_query(format!(
                "filter identifier collision: {name:?}"
            )));
        }
        Ok(self.add(key, filter))
    }

    fn note(&mut self, line: String) {
        tracing::debug!(target: "framedex_core::query", "{line}");
        self.log.push(line);
    }

    /// Evaluate every filter. Fails with [`FramedexError::QueryOverflow`] when
    /// no index probe was cheap enough to restrict the candidates.
    pub fn evaluate(&mut self) -> Result<QueryResult<'s>> {
        let started = Instant::now();
        self.log.clear();
        let options = self.options;
        let time_limit = Duration::from_millis(options.time_limit_ms);
        let mut result = QueryResult::unpopulated(self.session, self.threaded);
        self.note(format!(
            "{} evaluation of {} filters",
            if self.threaded { "threaded" } else { "unthreaded" },
            self.filters.len()
        ));

        let mut estimates = Vec::new();
        for (key, filter) in &self.filters {
            if let Some(probe) = filter.probe() {
                let estimate = probe.estimate(self.session.mapping(probe.index()))?;
                estimates.push((estimate, key.clone()));
            }
        }
        estimates.sort();

        let mut remaining: BTreeSet<FilterKey> = self.filters.keys().cloned().collect();
        let mut size_limit = options.max_buffer as u64;
        let mut current_size: Option<usize> = None;
        for (estimate, key) in estimates {
            self.note(format!(
                "estimate {key}={estimate} size limit={size_limit} [{:?}]",
                started.elapsed()
            ));
            let mut use_index = estimate < size_limit || options.truncate_size.is_some();
            if let (Some(size), Some(materialize)) = (current_size, options.materialize_size) {
                if size < materialize {
                    use_index = false;
                }
            }
            if !use_index {
                self.note(format!(
                    "estimate {estimate} for size {current_size:?} switches to testing"
                ));
                break;
            }
            let Some(filter) = self.filters.get(&key) else {
                continue;
            };
            let Some(probe) = filter.probe() else {
                continue;
            };
            let exact = filter.is_exact();
            let hits = probe.evaluate(self.session.mapping(probe.index()), options.truncate_size)?;
            if hits.truncated {
                result.mark_truncated();
            }
            let found = hits.ids.len();
            result.intersect_ids(hits.ids);
            if exact {
                remaining.remove(&key);
            }
            let size = result.len();
            current_size = Some(size);
            size_limit = (options.switch_factor as u64)
                .saturating_mul(size as u64)
                .saturating_add(100)
                .min(options.max_buffer as u64);
            self.note(format!(
                "evaluated {key} found {found} giving size={size} [{:?}]",
                started.elapsed()
            ));
        }

        if !result.is_populated() {
            self.note("aborting evaluation with overflow".to_owned());
            return Err(FramedexError::QueryOverflow);
        }
        if remaining.is_empty() {
            return Ok(result);
        }

        let tests: Vec<&Filter> = remaining
            .iter()
            .filter_map(|key| self.filters.get(key))
            .collect();
        let mut kept = BTreeMap::new();
        let mut timed_out = false;
        for id in result.identities()? {
            let entry = result.describe(&id)?;
            let doc = self.session.indexable(&entry);
            if tests.iter().all(|filter| filter.matches(&doc)) {
                kept.insert(id, entry);
            }
            if started.elapsed() > time_limit {
                timed_out = true;
                break;
            }
        }
        result.reset(kept);
        if timed_out {
            result.mark_truncated();
            self.note(format!(
                "terminating final evaluation early at {:?} with {} elements",
                started.elapsed(),
                result.len()
            ));
        }
        self.note(format!("evaluation complete at {:?}", started.elapsed()));
        Ok(result)
    }

    /// Compare every probe against a brute-force test of every entry.
    pub fn self_check(&self) -> Result<()> {
        let ids = self.session.all_ids(None)?;
        for (key, filter) in &self.filters {
            let Some(probe) = filter.probe() else {
                continue;
            };
            let hits = probe.evaluate(self.session.mapping(probe.index()), None)?;
            for id in &ids {
                let Some(entry) = self.session.describe(id)? else {
                    continue;
                };
                let passes = filter.matches(&self.session.indexable(&entry));
                let found = hits.ids.contains(id);
                if found && !passes && probe.is_exact() {
                    return Err(FramedexError::SelfCheck {
                        reason: format!("for {key} entry {id} is in the index but fails the test"),
                    });
                }
                if passes && !found {
                    return Err(FramedexError::SelfCheck {
                        reason: format!("for {key} entry {id} passes the test but is not in the index"),
                    });
                }
            }
        }
        Ok(())
    }

    /// A weaker query whose matches suggest completions: exact matches become
    /// prefixes, ranges become prefixes of their low bound, and proximity
    /// becomes a prefix of its last word.
    pub fn suggestion_query(&self) -> Query<'s> {
        let mut out = Query {
            session: self.session,
            threaded: self.threaded,
            options: self.options,
            filters: BTreeMap::new(),
            log: Vec::new(),
        };
        for (key, filter) in &self.filters {
            let weakened = match filter.test().suggestion_test() {
                Test::Prefix { attr, prefix } if !matches!(filter.test(), Test::Prefix { .. }) => {
                    self.session.attribute_prefix_filter(&attr, &prefix)
                }
                Test::AnyWord { word } if matches!(filter.test(), Test::Proximate { .. }) => {
                    self.session.word_filter(&word)
                }
                _ => filter.clone(),
            };
            out.filters.insert(key.clone(), weakened);
        }
        out
    }

    /// Sample words from up to `sample_size` entries matching the weakened
    /// query. An empty or overflowing query suggests nothing.
    pub fn suggestions(&self, sample_size: Option<usize>) -> Result<Suggestions> {
        let mut out = Suggestions::default();
        if self.filters.is_empty() {
            return Ok(out);
        }
        let mut weakened = self.suggestion_query();
        let result = match weakened.evaluate() {
            Ok(result) => result,
            Err(FramedexError::QueryOverflow) => return Ok(out),
            Err(err) => return Err(err),
        };
        let ids = result.identities()?;
        let take = sample_size.unwrap_or(ids.len());
        for id in ids.iter().take(take) {
            let entry = result.describe(id)?;
            for attr in entry.attribute_names() {
                let samples = entry.sample(attr, SUGGESTION_SAMPLE_WORDS);
                out.words.extend(samples.iter().cloned());
                out.by_attribute
                    .entry(attr.to_owned())
                    .or_default()
                    .extend(samples);
            }
        }
        Ok(out)
    }

    /// Render an entry's attributes as quoted HTML with each filter's matches
    /// wrapped in marks. Filters take `delimiters` in turn.
    pub fn annotate_dictionary(
        &self,
        entry: &Entry,
        delimiters: &[(&str, &str)],
    ) -> Result<BTreeMap<String, String>> {
        let delimiters = if delimiters.is_empty() {
            &[DEFAULT_DELIMITERS][..]
        } else {
            delimiters
        };
        let doc = self.session.indexable(entry);
        let mut marks: Annotations = doc
            .iter()
            .map(|(attr, values)| {
                let annotators = values.iter().map(|v| Annotator::quoted(v.as_str())).collect();
                (attr.clone(), annotators)
            })
            .collect();
        for (i, filter) in self.filters.values().enumerate() {
            let (before, after) = delimiters[i % delimiters.len()];
            filter.test().annotate(&doc, &mut marks, before, after)?;
        }
        Ok(marks
            .into_iter()
            .map(|(attr, annotators)| {
                let rendered: Vec<String> = annotators.iter().map(Annotator::render).collect();
                (attr, rendered.join("\n"))
            })
            .collect())
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 3);
        let mut root = BytesStart::new("query");
        root.push_attribute(("threaded", if self.threaded { "true" } else { "false" }));
        writer.write_event(Event::Start(root))?;
        for filter in self.filters.values() {
            filter.test().write_xml(&mut writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new("query")))?;
        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|err| FramedexError::invalid_query(format!("xml is not utf-8: {err}")))
    }

    /// The log of the last evaluation.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn report(&self) -> String {
        format!("Query log:\n{}", self.log.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::query::EvaluationStatus;
    use crate::types::SessionOptions;

    fn fox_session(dir: &TempDir) -> Session {
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        session
            .index_document("a", [("text".to_owned(), "the quick fox".into())].into())
            .unwrap();
        session
            .index_document("b", [("text".to_owned(), "the slow fox".into())].into())
            .unwrap();
        session
            .index_document("c", [("title".to_owned(), "lazy dogs".into())].into())
            .unwrap();
        session.store(None).unwrap();
        session
    }

    #[test]
    fn exact_filters_restrict_by_index() {
        let dir = TempDir::new().unwrap();
        let session = fox_session(&dir);
        let mut query = Query::new(&session);
        query.any_word("fox").unwrap().any_word("quick").unwrap();
        let result = query.evaluate().unwrap();
        assert_eq!(result.identities().unwrap(), vec!["a"]);
        assert!(!result.is_truncated());
        assert!(query.report().contains("evaluated"));
        query.self_check().unwrap();
    }

    #[test]
    fn proximity_is_tested_after_probes() {
        let dir = TempDir::new().unwrap();
        let session = fox_session(&dir);
        let mut query = Query::new(&session);
        query.proximate_words(["the", "fox"], 1).unwrap();
        assert_eq!(query.evaluate().unwrap().identities().unwrap(), vec!["a", "b"]);

        let mut tight = Query::new(&session);
        tight.proximate_words(["the", "fox"], 0).unwrap();
        assert!(tight.evaluate().unwrap().identities().unwrap().is_empty());
    }

    fn quick_session(dir: &TempDir, options: SessionOptions) -> Session {
        let mut session = Session::create(dir.path(), None, options).unwrap();
        let texts = (0..5)
            .map(|i| (format!("q{i}"), "quick fox"))
            .chain((0..3).map(|i| (format!("r{i}"), "fox quick")));
        for (id, text) in texts {
            session
                .index_document(&id, [("text".to_owned(), text.into())].into())
                .unwrap();
        }
        session.store(None).unwrap();
        session
    }

    #[test]
    fn row_cap_truncates_index_lookups() {
        let dir = TempDir::new().unwrap();
        let mut options = SessionOptions::default();
        options.query.truncate_size = Some(2);
        let session = quick_session(&dir, options);

        let mut query = Query::new(&session);
        query.any_word("quick").unwrap();
        let capped = query.evaluate().unwrap();
        assert_eq!(capped.status(), EvaluationStatus::Truncated);
        assert_eq!(capped.len(), 2);

        let mut full = Query::new(&session).with_options(QueryOptions::default());
        full.any_word("quick").unwrap();
        let full = full.evaluate().unwrap();
        assert!(!full.is_truncated());
        assert_eq!(full.len(), 8);
        for id in capped.identities().unwrap() {
            assert!(full.contains(&id), "{id}");
        }
    }

    #[test]
    fn time_limit_truncates_testing() {
        let dir = TempDir::new().unwrap();
        let mut options = SessionOptions::default();
        options.query.time_limit_ms = 0;
        let session = quick_session(&dir, options);

        let mut query = Query::new(&session);
        query.proximate_words(["quick", "fox"], 0).unwrap();
        let result = query.evaluate().unwrap();
        assert!(result.is_truncated());
        assert!(query.report().contains("terminating final evaluation early"));
        assert!(result.len() < 5);
        for id in result.identities().unwrap() {
            assert!(id.starts_with('q'), "{id} fails the proximity test");
        }
    }

    #[test]
    fn untestable_query_overflows() {
        let dir = TempDir::new().unwrap();
        let session = fox_session(&dir);
        let mut query = Query::new(&session);
        query
            .add_miscellaneous_filter(
                "near",
                session.proximate_filter(vec!["quick".into(), "fox".into()], 1),
            )
            .unwrap();
        assert!(matches!(query.evaluate(), Err(FramedexError::QueryOverflow)));
        assert!(
            query
                .add_miscellaneous_filter("near", session.word_filter("fox"))
                .is_err()
        );
    }

    #[test]
    fn suggestions_and_annotation() {
        let dir = TempDir::new().unwrap();
        let session = fox_session(&dir);
        let mut query = Query::new(&session);
        query.match_attribute("title", "lazy").unwrap();
        let suggestions = query.suggestions(None).unwrap();
        assert!(suggestions.words.contains("dogs"));

        let mut words = Query::new(&session);
        words.any_word("qui").unwrap();
        let entry = session.describe("a").unwrap().unwrap();
        let marked = words.annotate_dictionary(&entry, &[]).unwrap();
        assert_eq!(marked["text"], "the <b><em>qui</em></b>ck fox");
        assert!(words.to_xml().unwrap().contains(r#"<contains p="qui"/>"#));
    }
}
