//! Documents as stored and returned by a session.
//!
//! An [`Entry`] maps attribute names to ordered value lists. The identity is
//! mirrored under the reserved attribute `i` so that queries and dictionaries
//! can treat it like any other attribute.

use std::collections::BTreeMap;
use std::io::Cursor;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::constants::IDENTITY_ATTRIBUTE;
use crate::error::{FramedexError, Result};
use crate::text::{parse_words, quote};

/// How a special value is displayed and whether its target is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    ExpandedUrl,
    UnexpandedUrl,
    UnindexedUrl,
    ImageUrl,
    InternalLink,
}

impl SpecialKind {
    pub fn flag_name(self) -> &'static str {
        match self {
            Self::ExpandedUrl => "ExpandedURL",
            Self::UnexpandedUrl => "UnExpandedURL",
            Self::UnindexedUrl => "UnIndexedURL",
            Self::ImageUrl => "ImageURL",
            Self::InternalLink => "InternalLink",
        }
    }

    pub fn from_flag_name(name: &str) -> Option<Self> {
        Some(match name {
            "ExpandedURL" => Self::ExpandedUrl,
            "UnExpandedURL" => Self::UnexpandedUrl,
            "UnIndexedURL" => Self::UnindexedUrl,
            "ImageURL" => Self::ImageUrl,
            "InternalLink" => Self::InternalLink,
            _ => return None,
        })
    }

    /// Whether the target of the URL contributes indexable content.
    pub fn is_indexed(self) -> bool {
        matches!(self, Self::ExpandedUrl | Self::UnexpandedUrl)
    }
}

/// A value that is stored as text but rendered and indexed specially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialValue {
    pub kind: SpecialKind,
    pub text: String,
}

impl SpecialValue {
    pub fn new(kind: SpecialKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Content used for indexing. `url` is the text after URL translation.
    ///
    /// Only `file://` targets are read; any other URL indexes as its own text.
    pub fn content(&self, url: &str) -> String {
        if !self.kind.is_indexed() {
            return String::new();
        }
        if let Some(path) = file_url_path(url) {
            match fs_err::read_to_string(path) {
                Ok(text) => return text,
                Err(err) => {
                    tracing::warn!(url, error = %err, "special value target unreadable");
                }
            }
        }
        self.text.clone()
    }

    /// HTML rendering. `content` is only consulted for expanded URLs.
    pub fn html(&self, content: Option<&str>) -> String {
        match self.kind {
            SpecialKind::ExpandedUrl => quote(content.unwrap_or(&self.text)),
            SpecialKind::UnexpandedUrl | SpecialKind::UnindexedUrl => {
                format!("<a href=\"{0}\">{0}</a>", self.text)
            }
            SpecialKind::ImageUrl => format!("<img src=\"{}\">", self.text),
            SpecialKind::InternalLink => format!("<b> INTERNAL LINK TO {} </b>", self.text),
        }
    }
}

fn file_url_path(url: &str) -> Option<&str> {
    let lowered = url.get(..7)?.to_ascii_lowercase();
    (lowered == "file://").then(|| &url[7..])
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Special(SpecialValue),
}

impl AttrValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Display form: numbers without a fractional part print as integers.
    pub fn display_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Special(sv) => sv.text.clone(),
        }
    }

    pub fn as_special(&self) -> Option<&SpecialValue> {
        match self {
            Self::Special(sv) => Some(sv),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<SpecialValue> for AttrValue {
    fn from(value: SpecialValue) -> Self {
        Self::Special(value)
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// An identity plus an ordered attribute → values map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    identity: String,
    attrs: BTreeMap<String, Vec<AttrValue>>,
}

impl Entry {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let mut attrs = BTreeMap::new();
        attrs.insert(
            IDENTITY_ATTRIBUTE.to_owned(),
            vec![AttrValue::Text(identity.clone())],
        );
        Self { identity, attrs }
    }

    /// Build from an attribute map. An `i` attribute, if present, must equal the identity.
    pub fn with_attributes(
        identity: impl Into<String>,
        attrs: BTreeMap<String, Vec<AttrValue>>,
    ) -> Result<Self> {
        let mut entry = Self::new(identity);
        for (name, values) in attrs {
            if name == IDENTITY_ATTRIBUTE {
                if values != entry.attrs[IDENTITY_ATTRIBUTE] {
                    return Err(FramedexError::invalid_entry(format!(
                        "id for entry does not match id in dictionary: {:?}",
                        values
                    )));
                }
                continue;
            }
            entry.attrs.insert(name, values);
        }
        Ok(entry)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Attribute names including `i`, in sorted order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[AttrValue])> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn values(&self, attribute: &str) -> &[AttrValue] {
        self.attrs.get(attribute).map_or(&[], Vec::as_slice)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attrs.contains_key(attribute)
    }

    /// Append a value unless it is already present.
    pub fn add_value(&mut self, attribute: impl Into<String>, value: impl Into<AttrValue>) {
        let list = self.attrs.entry(attribute.into()).or_default();
        let value = value.into();
        if !list.contains(&value) {
            list.push(value);
        }
    }

    pub fn set_values(&mut self, attribute: impl Into<String>, values: Vec<AttrValue>) -> Result<()> {
        let attribute = attribute.into();
        if attribute == IDENTITY_ATTRIBUTE {
            let [AttrValue::Text(id)] = values.as_slice() else {
                return Err(FramedexError::invalid_entry("only one text id permitted"));
            };
            self.identity = id.clone();
        }
        self.attrs.insert(attribute, values);
        Ok(())
    }

    /// Joined display text for an attribute. Multiple values are joined by newlines.
    pub fn get(&self, attribute: &str) -> Option<String> {
        let values = self.attrs.get(attribute)?;
        Some(
            values
                .iter()
                .map(AttrValue::display_text)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Flatten to one string per attribute. `strict` refuses multi-valued attributes.
    pub fn as_dictionary(&self, strict: bool) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for (name, values) in &self.attrs {
            if values.is_empty() {
                continue;
            }
            if strict && values.len() > 1 {
                return Err(FramedexError::invalid_entry(format!(
                    "strict: attribute {name} has multiple values"
                )));
            }
            if let Some(text) = self.get(name) {
                out.insert(name.clone(), text);
            }
        }
        Ok(out)
    }

    /// Up to `limit` longer words taken from the middle of an attribute's text.
    pub fn sample(&self, attribute: &str, limit: usize) -> Vec<String> {
        let Some(text) = self.get(attribute) else {
            return Vec::new();
        };
        let words = parse_words(&text);
        words
            .iter()
            .skip(words.len() / 2)
            .filter(|w| w.chars().count() > 2)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 3);
        self.write_xml(&mut writer)?;
        Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
    }

    pub(crate) fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut start = BytesStart::new("entry");
        start.push_attribute(("id", self.identity.as_str()));
        writer.write_event(Event::Start(start))?;
        for (name, values) in &self.attrs {
            if name == IDENTITY_ATTRIBUTE {
                continue;
            }
            for value in values {
                let mut fld = BytesStart::new("fld");
                fld.push_attribute(("n", name.as_str()));
                if let AttrValue::Special(sv) = value {
                    fld.push_attribute(("special", sv.kind.flag_name()));
                }
                writer.write_event(Event::Start(fld))?;
                writer.write_event(Event::Text(BytesText::new(&value.display_text())))?;
                writer.write_event(Event::End(BytesEnd::new("fld")))?;
            }
        }
        writer.write_event(Event::End(BytesEnd::new("entry")))?;
        Ok(())
    }

    /// Parse a single `<entry id=..><fld n=..>..</fld></entry>` document.
    pub fn from_xml(text: &str) -> Result<Option<Self>> {
        Ok(entries_from_xml(text)?.into_iter().next())
    }
}

/// Parse either an `<entries>` wrapper or a bare `<entry>`.
///
/// Repeated identities and empty ids are rejected.
pub fn entries_from_xml(text: &str) -> Result<Vec<Entry>> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut out: Vec<Entry> = Vec::new();
    let mut current: Option<Entry> = None;
    let mut field: Option<(String, Option<SpecialKind>, String)> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"entry" => {
                let id = xml_attribute(&e, b"id")?.unwrap_or_default();
                if id.is_empty() {
                    return Err(FramedexError::invalid_entry("entry must have non empty id"));
                }
                if out.iter().any(|entry| entry.identity == id) {
                    return Err(FramedexError::invalid_entry(format!(
                        "repeated identity is not permitted: {id}"
                    )));
                }
                current = Some(Entry::new(id));
            }
            Event::Start(e) if e.name().as_ref() == b"fld" => {
                let name = xml_attribute(&e, b"n")?.unwrap_or_default();
                let special = xml_attribute(&e, b"special")?
                    .and_then(|flag| SpecialKind::from_flag_name(&flag));
                field = Some((name, special, String::new()));
            }
            Event::Text(t) => {
                if let Some((_, _, buf)) = field.as_mut() {
                    buf.push_str(&t.unescape()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"fld" => {
                if let (Some((name, special, text)), Some(entry)) = (field.take(), current.as_mut())
                {
                    let value = match special {
                        Some(kind) => AttrValue::Special(SpecialValue::new(kind, text)),
                        None => AttrValue::Text(text),
                    };
                    entry.add_value(name, value);
                }
            }
            Event::End(e) if e.name().as_ref() == b"entry" => {
                if let Some(entry) = current.take() {
                    out.push(entry);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

pub(crate) fn xml_attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        let mut entry = Entry::new("doc1");
        entry.add_value("title", "Fish & Chips");
        entry.add_value("year", 1999.0);
        entry.add_value("link", SpecialValue::new(SpecialKind::ImageUrl, "pic.png"));
        entry
    }

    #[test]
    fn identity_is_mirrored_as_attribute() {
        let entry = sample_entry();
        assert_eq!(entry.get("i").as_deref(), Some("doc1"));
        assert_eq!(entry.get("year").as_deref(), Some("1999"));
    }

    #[test]
    fn mismatched_identity_rejected() {
        let mut attrs = BTreeMap::new();
        attrs.insert("i".to_string(), vec![AttrValue::text("other")]);
        assert!(Entry::with_attributes("doc1", attrs).is_err());
    }

    #[test]
    fn duplicate_values_are_ignored() {
        let mut entry = Entry::new("x");
        entry.add_value("a", "one");
        entry.add_value("a", "one");
        entry.add_value("a", "two");
        assert_eq!(entry.values("a").len(), 2);
        assert_eq!(entry.get("a").as_deref(), Some("one\ntwo"));
        assert!(entry.as_dictionary(true).is_err());
        assert_eq!(entry.as_dictionary(false).unwrap()["a"], "one\ntwo");
    }

    #[test]
    fn xml_round_trip_keeps_specials() {
        let entry = sample_entry();
        let xml = entry.to_xml().unwrap();
        assert!(xml.contains("Fish &amp; Chips"));
        let parsed = Entry::from_xml(&xml).unwrap().unwrap();
        assert_eq!(parsed.identity(), "doc1");
        assert_eq!(parsed.get("title").as_deref(), Some("Fish & Chips"));
        assert!(matches!(
            parsed.values("link")[0],
            AttrValue::Special(SpecialValue { kind: SpecialKind::ImageUrl, .. })
        ));
    }

    #[test]
    fn sample_takes_middle_words() {
        let mut entry = Entry::new("s");
        entry.add_value("text", "an apple a banana the cherry");
        assert_eq!(entry.sample("text", 2), vec!["banana", "the"]);
    }

    #[test]
    fn special_content_only_for_indexed_kinds() {
        let link = SpecialValue::new(SpecialKind::InternalLink, "title::doc");
        assert_eq!(link.content("title::doc"), "");
        let url = SpecialValue::new(SpecialKind::UnexpandedUrl, "http://example.com/a");
        assert_eq!(url.content("http://example.com/a"), "http://example.com/a");
    }
}
