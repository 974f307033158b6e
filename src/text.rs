//! Word parsing, prefix location, completion suggestions and HTML annotation.
//!
//! Offsets are byte offsets into the original (not lowercased) text and always
//! fall on char boundaries.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::constants::WORD_TRUNCATION;
use crate::error::{FramedexError, Result};

#[allow(clippy::non_std_lazy_statics)]
static WORD_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\w+").unwrap()
});

fn truncate_chars(word: &str, limit: usize) -> String {
    word.chars().take(limit).collect()
}

/// Lowercased, NFC-normalized words of `text`, each cut to the word length limit.
pub fn parse_words(text: &str) -> Vec<String> {
    let lowered: String = text.nfc().collect::<String>().to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|m| truncate_chars(m.as_str(), WORD_TRUNCATION))
        .collect()
}

/// Normalize a user-supplied word the same way indexed words are.
pub fn normalize_word(word: &str) -> String {
    truncate_chars(&word.nfc().collect::<String>().to_lowercase(), WORD_TRUNCATION)
}

/// `(start, end)` spans of every word in `text` that starts with `prefix`.
///
/// The span covers the prefix only, not the whole word.
pub fn find_prefix_in_text(prefix: &str, text: &str) -> Vec<(usize, usize)> {
    let prefix = prefix.to_lowercase();
    let prefix_chars = prefix.chars().count();
    let mut spans = Vec::new();
    for m in WORD_RE.find_iter(text) {
        let word = m.as_str();
        if !word.to_lowercase().starts_with(&prefix) {
            continue;
        }
        let end = word
            .char_indices()
            .nth(prefix_chars)
            .map_or(word.len(), |(i, _)| i);
        spans.push((m.start(), m.start() + end));
    }
    spans
}

/// One completion for `prefix` from `text`.
///
/// A word that merely extends the prefix is returned whole; an exact match is
/// returned together with the word that follows it.
pub fn suggest_completion_in_text(prefix: &str, text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    let prefix = prefix.to_lowercase();
    let mut words = WORD_RE.find_iter(&lowered).peekable();
    while let Some(m) = words.next() {
        let word = m.as_str();
        if !word.starts_with(&prefix) {
            continue;
        }
        let suggestion = if word.len() == prefix.len() {
            match words.peek() {
                Some(next) => format!("{word} {}", next.as_str()),
                None => word.to_owned(),
            }
        } else {
            word.to_owned()
        };
        if suggestion != prefix {
            return Some(suggestion);
        }
    }
    None
}

/// Per-line spans of prefix matches.
pub fn find_prefix_in_lines<'t>(prefix: &str, text: &'t str) -> Vec<(&'t str, Vec<(usize, usize)>)> {
    text.split('\n')
        .map(|line| (line, find_prefix_in_text(prefix, line)))
        .collect()
}

/// XML/HTML text quoting for `&`, `<` and `>`.
pub fn quote(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Insert markup around positions of a text while quoting the text itself.
#[derive(Debug, Clone)]
pub struct Annotator {
    text: String,
    quoted: bool,
    before: BTreeMap<usize, Vec<String>>,
    after: BTreeMap<usize, Vec<String>>,
}

impl Annotator {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quoted: false,
            before: BTreeMap::new(),
            after: BTreeMap::new(),
        }
    }

    /// Annotator that HTML-quotes the text when rendered.
    pub fn quoted(text: impl Into<String>) -> Self {
        let mut out = Self::new(text);
        out.quoted = true;
        out
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Insert `stuff` before the char at `index` (or at the end when `index == len`).
    /// Later insertions at the same index go first.
    pub fn insert_before(&mut self, index: usize, stuff: impl Into<String>) -> Result<()> {
        if index > self.text.len() || !self.text.is_char_boundary(index) {
            return Err(FramedexError::invalid_query(format!(
                "index not on string text: {index}"
            )));
        }
        self.before.entry(index).or_default().insert(0, stuff.into());
        Ok(())
    }

    /// Insert `stuff` after the char starting at `index`.
    pub fn insert_after(&mut self, index: usize, stuff: impl Into<String>) -> Result<()> {
        let ch = self
            .text
            .get(index..)
            .and_then(|rest| rest.chars().next())
            .ok_or_else(|| {
                FramedexError::invalid_query(format!("index not on string text: {index}"))
            })?;
        self.insert_at_end(index + ch.len_utf8(), stuff);
        Ok(())
    }

    fn insert_at_end(&mut self, end: usize, stuff: impl Into<String>) {
        self.after.entry(end).or_default().push(stuff.into());
    }

    /// Wrap each `(start, end)` span in the given marks.
    pub fn delimit(&mut self, before: &str, after: &str, spans: &[(usize, usize)]) -> Result<()> {
        for &(start, end) in spans {
            if end <= start {
                return Err(FramedexError::invalid_query(format!(
                    "bad delimit marks, start must be before end: {start}..{end}"
                )));
            }
            self.insert_before(start, before)?;
            self.insert_at_end(end, after);
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + 16);
        let emit_boundary = |out: &mut String, at: usize| {
            if let Some(list) = self.after.get(&at) {
                list.iter().for_each(|s| out.push_str(s));
            }
            if let Some(list) = self.before.get(&at) {
                list.iter().for_each(|s| out.push_str(s));
            }
        };
        for (i, ch) in self.text.char_indices() {
            emit_boundary(&mut out, i);
            match ch {
                '&' if self.quoted => out.push_str("&amp;"),
                '<' if self.quoted => out.push_str("&lt;"),
                '>' if self.quoted => out.push_str("&gt;"),
                _ => out.push(ch),
            }
        }
        emit_boundary(&mut out, self.text.len());
        out
    }
}

impl std::fmt::Display for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote `text` and wrap every word starting with `prefix` in the marks.
pub fn delimit_matches(text: &str, prefix: &str, before: &str, after: &str) -> Result<Annotator> {
    let mut annotator = Annotator::quoted(text);
    annotator.delimit(before, after, &find_prefix_in_text(prefix, text))?;
    Ok(annotator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_lowercased_and_truncated() {
        let long = "x".repeat(40);
        let words = parse_words(&format!("The Quick, fox! {long}"));
        assert_eq!(words[..3], ["the", "quick", "fox"]);
        assert_eq!(words[3].len(), WORD_TRUNCATION);
    }

    #[test]
    fn annotator_orders_insertions() {
        let mut a = Annotator::quoted("this is a <b>test</b>");
        a.insert_before(5, "<code>").unwrap();
        a.insert_after(8, "</code>").unwrap();
        a.insert_before(9, "<em>").unwrap();
        a.insert_after(20, "</em>").unwrap();
        a.insert_before(0, "<h1>").unwrap();
        a.insert_after(20, "</h1>").unwrap();
        assert_eq!(
            a.render(),
            "<h1>this <code>is a</code><em> &lt;b&gt;test&lt;/b&gt;</em></h1>"
        );
        assert!(a.insert_after(21, "x").is_err());
    }

    #[test]
    fn delimits_prefix_matches() {
        let text = "prefixinator \ncontaining\n prefix as prefixes several places";
        let out = delimit_matches(text, "prefix", "<b>", "</b>").unwrap();
        assert_eq!(
            out.render(),
            "<b>prefix</b>inator \ncontaining\n <b>prefix</b> as <b>prefix</b>es several places"
        );
    }

    #[test]
    fn completion_prefers_longer_word_or_next_word() {
        assert_eq!(
            suggest_completion_in_text("qui", "the Quick fox").as_deref(),
            Some("quick")
        );
        assert_eq!(
            suggest_completion_in_text("quick", "the quick fox").as_deref(),
            Some("quick fox")
        );
        assert_eq!(suggest_completion_in_text("fox", "the quick fox"), None);
    }
}
