//! The attribute catalog kept in the `System` index.
//!
//! Rows are `(opcode, subkey) -> value`:
//!
//! | Opcode | Subkey | Value |
//! |---|---|---|
//! | `U` | URL prefix | replacement prefix |
//! | `A` | attribute name | stored name |
//! | `F` | | free-text-only flag |
//! | `C` | | next abbreviation counter |
//! | `CL` | | auto-clean flag |
//!
//! Updates are made while holding the System archive's compaction lock,
//! after re-reading the catalog, so sessions that abbreviate concurrently
//! never hand out the same name twice.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use super::{IndexName, Session};
use crate::archive::{CompactionLock, LayeredArchive, SessionMapping};
use crate::constants::{
    CATALOG_LOCK_RETRIES, CATALOG_LOCK_SLEEP_MS, CHILD_ATTRIBUTE, IDENTITY_ATTRIBUTE,
    PARENT_ATTRIBUTE,
};
use crate::error::{FramedexError, Result};
use crate::types::{Entry, Key, Pair, Scalar, Value};

const URL_TRANSLATE: &str = "U";
const ATTRIBUTE_TRANSLATE: &str = "A";
const FREE_TEXT_ONLY: &str = "F";
const COUNTER_VALUE: &str = "C";
const AUTO_CLEAN: &str = "CL";

/// One persisted catalog setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Url { from: String, to: String },
    Attribute { from: String, to: String },
    FreeTextOnly(bool),
    Counter(i64),
    AutoClean(bool),
}

impl Directive {
    pub fn to_pair(&self) -> Pair {
        let (op, subkey, value) = match self {
            Self::Url { from, to } => (URL_TRANSLATE, from.as_str(), Value::from(to.as_str())),
            Self::Attribute { from, to } => {
                (ATTRIBUTE_TRANSLATE, from.as_str(), Value::from(to.as_str()))
            }
            Self::FreeTextOnly(flag) => (FREE_TEXT_ONLY, "", Value::Flag(*flag)),
            Self::Counter(n) => (COUNTER_VALUE, "", Value::Int(*n)),
            Self::AutoClean(flag) => (AUTO_CLEAN, "", Value::Flag(*flag)),
        };
        (Key::new([op, subkey]), value)
    }

    pub fn from_pair(key: &Key, value: &Value) -> Result<Self> {
        let bad = || FramedexError::catalog(format!("malformed system row {key} -> {value:?}"));
        let (Some(op), Some(subkey)) = (
            key.get(0).and_then(Scalar::as_text),
            key.get(1).and_then(Scalar::as_text),
        ) else {
            return Err(bad());
        };
        let text = || value.as_text().map(str::to_owned).ok_or_else(bad);
        let flag = || value.as_flag().ok_or_else(bad);
        Ok(match op {
            URL_TRANSLATE => Self::Url {
                from: subkey.to_owned(),
                to: text()?,
            },
            ATTRIBUTE_TRANSLATE => Self::Attribute {
                from: subkey.to_owned(),
                to: text()?,
            },
            FREE_TEXT_ONLY => Self::FreeTextOnly(flag()?),
            COUNTER_VALUE => Self::Counter(value.as_int().ok_or_else(bad)?),
            AUTO_CLEAN => Self::AutoClean(flag()?),
            other => {
                return Err(FramedexError::catalog(format!(
                    "unknown opcode {other:?} in system index"
                )));
            }
        })
    }
}

/// Attribute and URL translations plus the collection-wide flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeCatalog {
    urls: BTreeMap<String, String>,
    translations: BTreeMap<String, String>,
    untranslations: BTreeMap<String, String>,
    free_text_only: bool,
    auto_clean: bool,
    counter: i64,
}

impl Default for AttributeCatalog {
    fn default() -> Self {
        let identity = || BTreeMap::from([(IDENTITY_ATTRIBUTE.to_owned(), IDENTITY_ATTRIBUTE.to_owned())]);
        Self {
            urls: BTreeMap::new(),
            translations: identity(),
            untranslations: identity(),
            free_text_only: false,
            auto_clean: false,
            counter: 0,
        }
    }
}

impl AttributeCatalog {
    /// Read every directive visible in the System mapping.
    pub fn load(mapping: &SessionMapping) -> Result<Self> {
        let mut catalog = Self::default();
        let mut next = mapping.first()?;
        while let Some((key, value)) = next {
            catalog.apply(&Directive::from_pair(&key, &value)?)?;
            next = mapping.next_after(&key)?;
        }
        Ok(catalog)
    }

    fn apply(&mut self, directive: &Directive) -> Result<()> {
        match directive {
            Directive::Url { from, to } => {
                self.urls.insert(from.clone(), to.clone());
            }
            Directive::Attribute { from, to } => self.record_translation(from, to)?,
            Directive::FreeTextOnly(flag) => self.free_text_only = *flag,
            Directive::Counter(n) => self.counter = *n,
            Directive::AutoClean(flag) => self.auto_clean = *flag,
        }
        Ok(())
    }

    fn record_translation(&mut self, from: &str, to: &str) -> Result<()> {
        if let Some(existing) = self.translations.get(from) {
            if existing != to {
                return Err(FramedexError::catalog(format!(
                    "cannot change existing translation {from:?} -> {existing:?} to {to:?}"
                )));
            }
        }
        if let Some(existing) = self.untranslations.get(to) {
            if existing != from {
                return Err(FramedexError::catalog(format!(
                    "{to:?} already stands for {existing:?}, not {from:?}"
                )));
            }
        }
        self.translations.insert(from.to_owned(), to.to_owned());
        self.untranslations.insert(to.to_owned(), from.to_owned());
        Ok(())
    }

    /// Stored name for an attribute.
    pub fn translate<'a>(&'a self, name: &'a str) -> &'a str {
        self.translations.get(name).map_or(name, String::as_str)
    }

    /// Attribute name for a stored name.
    pub fn untranslate<'a>(&'a self, stored: &'a str) -> &'a str {
        self.untranslations.get(stored).map_or(stored, String::as_str)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.translations.contains_key(name)
    }

    /// Rewrite the longest matching URL prefix.
    pub fn translate_url(&self, url: &str) -> String {
        self.urls
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or_else(
                || url.to_owned(),
                |(prefix, replacement)| format!("{replacement}{}", &url[prefix.len()..]),
            )
    }

    pub fn is_free_text_only(&self) -> bool {
        self.free_text_only
    }

    pub fn auto_clean(&self) -> bool {
        self.auto_clean
    }

    pub fn counter(&self) -> i64 {
        self.counter
    }

    /// Record `from -> to`. With `check`, a purely numeric `to` is refused,
    /// since those names are reserved for abbreviations.
    pub fn add_attribute_translation(&mut self, from: &str, to: &str, check: bool) -> Result<Directive> {
        if check && to.trim().parse::<i64>().is_ok() {
            return Err(FramedexError::catalog(format!(
                "attribute name cannot be only numeric: {to:?}"
            )));
        }
        self.record_translation(from, to)?;
        Ok(Directive::Attribute {
            from: from.to_owned(),
            to: to.to_owned(),
        })
    }

    pub fn add_url_translation(&mut self, from: &str, to: &str) -> Directive {
        self.urls.insert(from.to_owned(), to.to_owned());
        Directive::Url {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }

    pub fn set_free_text_only(&mut self, flag: bool) -> Directive {
        self.free_text_only = flag;
        Directive::FreeTextOnly(flag)
    }

    pub fn set_auto_clean(&mut self, flag: bool) -> Directive {
        self.auto_clean = flag;
        Directive::AutoClean(flag)
    }

    /// The next unused counter name.
    fn next_abbreviation(&mut self) -> String {
        loop {
            let name = self.counter.to_string();
            self.counter += 1;
            if !self.untranslations.contains_key(&name) {
                return name;
            }
        }
    }

    /// Give `name` a short stored name unless it already has one.
    pub fn abbreviate(&mut self, name: &str) -> Result<Vec<Directive>> {
        if self.is_known(name) {
            return Ok(Vec::new());
        }
        let short = self.next_abbreviation();
        let translation = self.add_attribute_translation(name, &short, false)?;
        Ok(vec![translation, Directive::Counter(self.counter)])
    }
}

fn lock_catalog(archive: &LayeredArchive) -> Result<CompactionLock<'_>> {
    for attempt in 0..CATALOG_LOCK_RETRIES {
        if let Some(lock) = archive.try_lock(false)? {
            return Ok(lock);
        }
        tracing::debug!(attempt, "catalog lock busy");
        std::thread::sleep(Duration::from_millis(CATALOG_LOCK_SLEEP_MS));
    }
    Err(FramedexError::Lock {
        path: archive.root().to_path_buf(),
    })
}

/// Attributes recording thread structure rather than entry content.
pub(crate) fn is_link_attribute(name: &str) -> bool {
    name == CHILD_ATTRIBUTE || name == PARENT_ATTRIBUTE
}

impl Session {
    /// Re-read the catalog under the System lock, apply `change` and publish
    /// the resulting directives immediately.
    fn update_catalog<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut AttributeCatalog) -> Result<Vec<Directive>>,
    {
        self.writable()?;
        let archive = Rc::clone(&self.archives[IndexName::System.slot()]);
        let lock = lock_catalog(&archive)?;
        {
            let system = self.mapping_mut(IndexName::System);
            system.sync()?;
            system.reload()?;
        }
        self.catalog = AttributeCatalog::load(self.mapping(IndexName::System))?;
        let directives = match change(&mut self.catalog) {
            Ok(directives) => directives,
            Err(err) => {
                self.catalog = AttributeCatalog::load(self.mapping(IndexName::System))?;
                return Err(err);
            }
        };
        let system = self.mapping_mut(IndexName::System);
        system.put_all(directives.iter().map(Directive::to_pair))?;
        system.store(false)?;
        drop(lock);
        tracing::debug!(
            root = %self.root.display(),
            directives = directives.len(),
            "attribute catalog updated"
        );
        Ok(())
    }

    /// Store `from` under the name `to`. The collection should not yet hold
    /// values for `from`.
    pub fn add_attribute_translation(&mut self, from: &str, to: &str, check: bool) -> Result<()> {
        self.update_catalog(|catalog| Ok(vec![catalog.add_attribute_translation(from, to, check)?]))
    }

    /// Read URLs starting with `from` through `to` instead, e.g. a web
    /// prefix through a local `file://` directory.
    pub fn add_url_translation(&mut self, from: &str, to: &str) -> Result<()> {
        self.update_catalog(|catalog| Ok(vec![catalog.add_url_translation(from, to)]))
    }

    /// Stop writing attribute value and attribute word indexes.
    pub fn set_free_text_only(&mut self, flag: bool) -> Result<()> {
        self.update_catalog(|catalog| Ok(vec![catalog.set_free_text_only(flag)]))
    }

    /// Run a complete clean-up after every aggregation.
    pub fn set_auto_clean(&mut self, flag: bool) -> Result<()> {
        self.update_catalog(|catalog| Ok(vec![catalog.set_auto_clean(flag)]))
    }

    pub fn translate_url(&self, url: &str) -> String {
        self.catalog.translate_url(url)
    }

    /// Abbreviate the entry's attribute names the catalog has not seen yet.
    pub(crate) fn abbreviate_unknown(&mut self, entry: &Entry) -> Result<()> {
        if !self.options.auto_abbreviate {
            return Ok(());
        }
        let unknown: Vec<String> = entry
            .attribute_names()
            .filter(|name| !is_link_attribute(name) && !self.catalog.is_known(name))
            .map(str::to_owned)
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        self.update_catalog(|catalog| {
            let mut directives = Vec::new();
            for name in &unknown {
                directives.extend(catalog.abbreviate(name)?);
            }
            Ok(directives)
        })
    }
}
