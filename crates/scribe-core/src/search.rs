use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::cache::QueryCache;
use crate::store::DocumentStore;
use crate::tags::parse_list;

/// Titles whose title or text contains `query` (case-insensitive), skipping
/// system notes and notes carrying any of `exclude_tags`. Sorted.
pub fn search_titles(store: &dyn DocumentStore, query: &str, exclude_tags: &[String]) -> Vec<String> {
    let needle = query.trim().to_lowercase();
    let mut hits: Vec<String> = store
        .list()
        .into_iter()
        .filter(|title| !title.starts_with("$:/"))
        .filter_map(|title| {
            let fields = store.get(&title)?;
            if let Some(tags) = fields.get("tags") {
                if parse_list(tags).iter().any(|tag| exclude_tags.contains(tag)) {
                    return None;
                }
            }
            let matches = needle.is_empty()
                || title.to_lowercase().contains(&needle)
                || fields
                    .get("text")
                    .map(|text| text.to_lowercase().contains(&needle))
                    .unwrap_or(false);
            matches.then_some(title)
        })
        .collect();
    hits.sort();
    hits
}

/// Title search fronted by a [`QueryCache`].
#[derive(Clone)]
pub struct CachedSearch {
    store: Arc<dyn DocumentStore>,
    cache: Arc<QueryCache>,
}

impl CachedSearch {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<QueryCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn search(&self, query: &str, exclude_tags: &[String]) -> Vec<String> {
        if let Some(cached) = self.cache.get(query, exclude_tags) {
            if let Ok(titles) = serde_json::from_value::<Vec<String>>(cached) {
                return titles;
            }
            self.cache.invalidate(query, exclude_tags);
        }
        let titles = search_titles(self.store.as_ref(), query, exclude_tags);
        debug!(query, results = titles.len(), "search computed");
        self.cache.set(query, exclude_tags, json!(titles));
        titles
    }
}
