use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Captures, Regex};

/// Field map of a single note. `title` is the key, `text` the body.
pub type Fields = BTreeMap<String, String>;

/// Note holding the titles currently open in the story river.
pub const STORY_LIST_TITLE: &str = "$:/StoryList";

// A lone `]` may appear inside a label or target; `]]` always closes the link.
static RE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[((?:[^\]|]|\][^\]|])*\|)?((?:[^\]|]|\][^\]|])+)\]\]").expect("link regex")
});
static RE_TRANSCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}|]+)(\|\|[^{}]*)?\}\}").expect("transclusion regex"));

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document '{0}' not found")]
    NotFound(String),
    #[error("store rejected write to '{title}': {reason}")]
    Rejected { title: String, reason: String },
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Named-document store the actions mutate.
pub trait DocumentStore: Send + Sync {
    fn exists(&self, title: &str) -> bool;
    fn get(&self, title: &str) -> Option<Fields>;
    fn put(&self, title: &str, fields: Fields) -> Result<(), StoreError>;
    fn delete(&self, title: &str) -> Result<(), StoreError>;
    fn list(&self) -> Vec<String>;
    /// Titles of documents whose text links to or transcludes `title`.
    fn links_referencing(&self, title: &str) -> Vec<String>;
}

/// Targets of `[[target]]`, `[[label|target]]`, `{{target}}` and
/// `{{target||template}}` references in `text`.
pub fn extract_links(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for caps in RE_LINK.captures_iter(text) {
        out.insert(caps[2].trim().to_string());
    }
    for caps in RE_TRANSCLUDE.captures_iter(text) {
        out.insert(caps[1].trim().to_string());
    }
    out
}

/// Rewrite every reference to `old` so it points at `new`. Link labels are
/// preserved.
pub fn rewrite_links(text: &str, old: &str, new: &str) -> String {
    let relinked = RE_LINK.replace_all(text, |caps: &Captures<'_>| {
        if caps[2].trim() == old {
            let label = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            format!("[[{label}{new}]]")
        } else {
            caps[0].to_string()
        }
    });
    RE_TRANSCLUDE
        .replace_all(&relinked, |caps: &Captures<'_>| {
            if caps[1].trim() == old {
                let template = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                format!("{{{{{new}{template}}}}}")
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// In-process store; also loads and saves the JSON array export format.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Fields>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = Fields>,
    {
        let store = Self::new();
        {
            let mut map = store.docs.write();
            for fields in docs {
                if let Some(title) = fields.get("title").cloned() {
                    map.insert(title, fields);
                }
            }
        }
        store
    }

    pub fn load_json(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let docs: Vec<Fields> = serde_json::from_slice(&bytes)?;
        Ok(Self::from_documents(docs))
    }

    pub fn save_json(&self, path: &Path) -> Result<(), StoreError> {
        let docs: Vec<Fields> = self.docs.read().values().cloned().collect();
        let bytes = serde_json::to_vec_pretty(&docs)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

impl DocumentStore for MemoryStore {
    fn exists(&self, title: &str) -> bool {
        self.docs.read().contains_key(title)
    }

    fn get(&self, title: &str) -> Option<Fields> {
        self.docs.read().get(title).cloned()
    }

    fn put(&self, title: &str, mut fields: Fields) -> Result<(), StoreError> {
        fields.insert("title".into(), title.to_string());
        self.docs.write().insert(title.to_string(), fields);
        Ok(())
    }

    fn delete(&self, title: &str) -> Result<(), StoreError> {
        self.docs.write().remove(title);
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        self.docs.read().keys().cloned().collect()
    }

    fn links_referencing(&self, title: &str) -> Vec<String> {
        self.docs
            .read()
            .iter()
            .filter(|(_, fields)| {
                fields
                    .get("text")
                    .map(|text| extract_links(text).contains(title))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}
