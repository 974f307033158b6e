//! Filters: an optional index probe plus the predicate it stands for.
//!
//! Predicates run against an entry's indexable text (see
//! [`Session::indexable`](crate::Session::indexable)): one string per value,
//! with special values replaced by their content.

use std::collections::BTreeMap;

use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};

use super::probe::Probe;
use crate::constants::SHORT_WORD_LENGTH;
use crate::error::Result;
use crate::text::{Annotator, find_prefix_in_text, parse_words};
use crate::types::ProximityOptions;

/// Attribute name to indexable texts.
pub type Indexable = BTreeMap<String, Vec<String>>;

/// Per-value annotators aligned with an [`Indexable`].
pub type Annotations = BTreeMap<String, Vec<Annotator>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    /// Some value equals `value`.
    Match { attr: String, value: String },
    /// Some value starts with `prefix`.
    Prefix { attr: String, prefix: String },
    /// Some value lies in `low..=high`.
    Range { attr: String, low: String, high: String },
    /// Some indexed word of `attr` starts with `word`.
    AttrWord { attr: String, word: String },
    /// Some indexed word of any attribute starts with `word`.
    AnyWord { word: String },
    /// The words appear in order within one value, each within `limit`
    /// words of the previous one.
    Proximate {
        words: Vec<String>,
        limit: usize,
        proximity: ProximityOptions,
    },
}

fn values<'d>(doc: &'d Indexable, attr: &str) -> &'d [String] {
    doc.get(attr).map_or(&[], Vec::as_slice)
}

fn is_indexed_word(word: &str) -> bool {
    word.chars().count() > SHORT_WORD_LENGTH
}

fn has_word_prefix(value: &str, word: &str) -> bool {
    parse_words(value)
        .iter()
        .any(|w| is_indexed_word(w) && w.starts_with(word))
}

impl Test {
    pub fn matches(&self, doc: &Indexable) -> bool {
        match self {
            Self::Match { attr, value } => values(doc, attr).iter().any(|v| v == value),
            Self::Prefix { attr, prefix } => values(doc, attr)
                .iter()
                .any(|v| v.starts_with(prefix.as_str())),
            Self::Range { attr, low, high } => values(doc, attr)
                .iter()
                .any(|v| low.as_str() <= v.as_str() && v.as_str() <= high.as_str()),
            Self::AttrWord { attr, word } => values(doc, attr)
                .iter()
                .any(|v| has_word_prefix(v, word)),
            Self::AnyWord { word } => doc.values().flatten().any(|v| has_word_prefix(v, word)),
            Self::Proximate {
                words,
                limit,
                proximity,
            } => doc
                .values()
                .flatten()
                .any(|v| proximate_in_value(v, words, *limit, proximity)),
        }
    }

    /// The predicate used when sampling completions for a partial query.
    pub fn suggestion_test(&self) -> Self {
        match self {
            Self::Match { attr, value } => Self::Prefix {
                attr: attr.clone(),
                prefix: value.clone(),
            },
            Self::Range { attr, low, .. } => Self::Prefix {
                attr: attr.clone(),
                prefix: low.clone(),
            },
            Self::Proximate { words, .. } => Self::AnyWord {
                word: words.last().cloned().unwrap_or_default(),
            },
            other => other.clone(),
        }
    }

    /// Mark the parts of `doc` this predicate matched.
    pub fn annotate(
        &self,
        doc: &Indexable,
        marks: &mut Annotations,
        before: &str,
        after: &str,
    ) -> Result<()> {
        match self {
            Self::Match { attr, value } => {
                mark_values(doc, marks, attr, before, after, |v| {
                    (v == value).then(|| vec![(0, v.len())])
                })
            }
            Self::Prefix { attr, prefix } => {
                mark_values(doc, marks, attr, before, after, |v| {
                    v.starts_with(prefix.as_str()).then(|| vec![(0, prefix.len())])
                })
            }
            Self::Range { attr, low, high } => {
                mark_values(doc, marks, attr, before, after, |v| {
                    (low.as_str() <= v && v <= high.as_str()).then(|| vec![(0, v.len())])
                })
            }
            Self::AttrWord { attr, word } => mark_values(doc, marks, attr, before, after, |v| {
                Some(find_prefix_in_text(word, v))
            }),
            Self::AnyWord { word } => {
                for attr in doc.keys() {
                    mark_values(doc, marks, attr, before, after, |v| {
                        Some(find_prefix_in_text(word, v))
                    })?;
                }
                Ok(())
            }
            Self::Proximate { .. } => Ok(()),
        }
    }

    pub fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let element = match self {
            Self::Match { attr, value } => {
                let mut e = BytesStart::new("match");
                e.push_attribute(("n", attr.as_str()));
                e.push_attribute(("v", value.as_str()));
                e
            }
            Self::Prefix { attr, prefix } => {
                let mut e = BytesStart::new("prefix");
                e.push_attribute(("n", attr.as_str()));
                e.push_attribute(("p", prefix.as_str()));
                e
            }
            Self::Range { attr, low, high } => {
                let mut e = BytesStart::new("range");
                e.push_attribute(("n", attr.as_str()));
                e.push_attribute(("low", low.as_str()));
                e.push_attribute(("high", high.as_str()));
                e
            }
            Self::AttrWord { attr, word } => {
                let mut e = BytesStart::new("contains");
                e.push_attribute(("n", attr.as_str()));
                e.push_attribute(("p", word.as_str()));
                e
            }
            Self::AnyWord { word } => {
                let mut e = BytesStart::new("contains");
                e.push_attribute(("p", word.as_str()));
                e
            }
            Self::Proximate { words, limit, .. } => {
                let mut e = BytesStart::new("near");
                e.push_attribute(("limit", limit.to_string().as_str()));
                e.push_attribute(("words", words.join(" ").as_str()));
                e
            }
        };
        writer.write_event(Event::Empty(element))?;
        Ok(())
    }
}

fn mark_values(
    doc: &Indexable,
    marks: &mut Annotations,
    attr: &str,
    before: &str,
    after: &str,
    spans_of: impl Fn(&str) -> Option<Vec<(usize, usize)>>,
) -> Result<()> {
    let Some(annotators) = marks.get_mut(attr) else {
        return Ok(());
    };
    for (value, annotator) in values(doc, attr).iter().zip(annotators.iter_mut()) {
        if let Some(spans) = spans_of(value) {
            let spans: Vec<_> = spans.into_iter().filter(|(s, e)| s < e).collect();
            annotator.delimit(before, after, &spans)?;
        }
    }
    Ok(())
}

/// An index probe and the predicate it approximates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    probe: Option<Probe>,
    test: Test,
}

impl Filter {
    pub fn new(probe: Option<Probe>, test: Test) -> Self {
        Self { probe, test }
    }

    /// A filter with no index support; it can only narrow other results.
    pub fn tested(test: Test) -> Self {
        Self { probe: None, test }
    }

    pub fn probe(&self) -> Option<&Probe> {
        self.probe.as_ref()
    }

    pub fn test(&self) -> &Test {
        &self.test
    }

    /// True when the probe's hits are exactly the entries passing the test.
    pub fn is_exact(&self) -> bool {
        self.probe.as_ref().is_some_and(Probe::is_exact)
    }

    pub fn matches(&self, doc: &Indexable) -> bool {
        self.test.matches(doc)
    }
}

fn proximate_in_value(value: &str, words: &[String], limit: usize, options: &ProximityOptions) -> bool {
    if value.is_empty() {
        return false;
    }
    let lowered = value.to_lowercase();
    quick_proximate_filter(&lowered, words, options.chunk_size, options.delta_size)
        && proximate_match_anywhere(&parse_words(&lowered), words, SHORT_WORD_LENGTH, limit)
}

fn find_from(text: &str, word: &str, from: usize) -> Option<usize> {
    text.get(from..)?.find(word).map(|at| at + from)
}

fn step_past(text: &str, cursor: Option<usize>) -> usize {
    cursor.map_or(0, |at| {
        at + text
            .get(at..)
            .and_then(|rest| rest.chars().next())
            .map_or(1, char::len_utf8)
    })
}

/// Cheap elimination: the words occur in order, and some occurrence of the
/// first word has the rest within `chunk` bytes (widened by `delta` per word).
pub fn quick_proximate_filter(text: &str, words: &[String], chunk: usize, delta: usize) -> bool {
    let Some((first, rest)) = words.split_first() else {
        return false;
    };
    let mut cursor = None;
    for word in words {
        match find_from(text, word, step_past(text, cursor)) {
            Some(at) => cursor = Some(at),
            None => return false,
        }
    }
    let mut search = None;
    loop {
        let Some(first_at) = find_from(text, first, step_past(text, search)) else {
            return false;
        };
        search = Some(first_at);
        let mut too_far = first_at + chunk;
        let mut next = first_at;
        for word in rest {
            let Some(at) = find_from(text, word, next) else {
                return false;
            };
            next = at;
            if next > too_far {
                break;
            }
            too_far += delta;
        }
        if next <= too_far {
            return true;
        }
    }
}

/// True when `words` match, as prefixes and in order, words of `split`
/// longer than `min_len`, each following the previous match within
/// `limit + 1` positions.
pub fn proximate_match_anywhere(split: &[String], words: &[String], min_len: usize, limit: usize) -> bool {
    match_from(split, words, min_len, limit, 0, split.len(), 0)
}

fn match_from(
    split: &[String],
    words: &[String],
    min_len: usize,
    limit: usize,
    from: usize,
    to: usize,
    position: usize,
) -> bool {
    let Some(word) = words.get(position) else {
        return true;
    };
    let to = to.min(split.len());
    for i in from..to {
        let candidate = &split[i];
        if candidate.chars().count() > min_len && candidate.starts_with(word.as_str()) {
            if position + 1 >= words.len()
                || match_from(split, words, min_len, limit, i + 1, i + limit + 2, position + 1)
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_owned).collect()
    }

    fn doc(pairs: &[(&str, &str)]) -> Indexable {
        let mut out = Indexable::new();
        for (attr, value) in pairs {
            out.entry((*attr).to_owned()).or_default().push((*value).to_owned());
        }
        out
    }

    #[test]
    fn proximity_follows_window() {
        let split = words("this is a test");
        assert!(proximate_match_anywhere(&split, &words("is test"), 1, 3));
        assert!(!proximate_match_anywhere(&split, &words("test this"), 1, 30));
        assert!(!proximate_match_anywhere(&split, &words("this test"), 1, 0));
        assert!(proximate_match_anywhere(&split, &words("this test"), 1, 1));
    }

    #[test]
    fn quick_filter_requires_order_and_span() {
        let text = "alpha beta gamma";
        assert!(quick_proximate_filter(text, &words("alpha gamma"), 100, 20));
        assert!(!quick_proximate_filter(text, &words("gamma alpha"), 100, 20));
        let far = format!("alpha {} gamma", "x".repeat(300));
        assert!(!quick_proximate_filter(&far, &words("alpha gamma"), 100, 20));
        let twice = format!("alpha {} alpha gamma", "x".repeat(300));
        assert!(quick_proximate_filter(&twice, &words("alpha gamma"), 100, 20));
    }

    #[test]
    fn tests_read_indexable_text() {
        let d = doc(&[("title", "The Quick fox"), ("year", "1999"), ("i", "a")]);
        let check = |test: Test| test.matches(&d);
        assert!(check(Test::Match {
            attr: "year".into(),
            value: "1999".into()
        }));
        assert!(check(Test::Range {
            attr: "year".into(),
            low: "1990".into(),
            high: "1999".into()
        }));
        assert!(check(Test::Prefix {
            attr: "title".into(),
            prefix: "The Q".into()
        }));
        assert!(check(Test::AttrWord {
            attr: "title".into(),
            word: "qu".into()
        }));
        // Words of two characters or fewer are never indexed.
        assert!(!check(Test::AnyWord { word: "a".into() }));
        assert!(check(Test::Proximate {
            words: words("the fox"),
            limit: 1,
            proximity: ProximityOptions::default()
        }));
    }

    #[test]
    fn annotation_marks_word_prefixes() {
        let d = doc(&[("title", "fish & foxes")]);
        let mut marks: Annotations = d
            .iter()
            .map(|(a, vs)| (a.clone(), vs.iter().map(|v| Annotator::quoted(v.as_str())).collect()))
            .collect();
        Test::AnyWord { word: "fox".into() }
            .annotate(&d, &mut marks, "<b>", "</b>")
            .unwrap();
        assert_eq!(marks["title"][0].render(), "fish &amp; <b>fox</b>es");
    }

    #[test]
    fn suggestion_tests_weaken_exact_forms() {
        let m = Test::Match {
            attr: "a".into(),
            value: "qu".into(),
        };
        assert_eq!(
            m.suggestion_test(),
            Test::Prefix {
                attr: "a".into(),
                prefix: "qu".into()
            }
        );
        let p = Test::Proximate {
            words: words("quick fox"),
            limit: 2,
            proximity: ProximityOptions::default(),
        };
        assert_eq!(p.suggestion_test(), Test::AnyWord { word: "fox".into() });
    }
}
