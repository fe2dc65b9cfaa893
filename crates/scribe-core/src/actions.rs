//! Closed catalog of note mutations: create, rename and modify.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::ErrorKind;
use crate::store::{rewrite_links, DocumentStore, Fields, StoreError, STORY_LIST_TITLE};
use crate::tags::{parse_list, stringify_list};
use crate::validation::Intent;

pub const DEFAULT_CONTENT_TYPE: &str = "text/vnd.tiddlywiki";

/// Fields `modify` may not touch through `updates`.
const RESERVED_FIELDS: &[&str] = &["title", "tags"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Rename,
    Modify,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Rename => "rename",
            ActionKind::Modify => "modify",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Extra fields; `title`, `text` and `tags` here are overridden.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameParams {
    pub old_title: String,
    pub new_title: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Replace,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub value: String,
    #[serde(default)]
    pub mode: UpdateMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyParams {
    pub title: String,
    #[serde(default)]
    pub updates: Vec<FieldUpdate>,
    #[serde(default)]
    pub tags_to_add: Vec<String>,
    #[serde(default)]
    pub tags_to_remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionParams {
    Create(CreateParams),
    Rename(RenameParams),
    Modify(ModifyParams),
}

impl ActionParams {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionParams::Create(_) => ActionKind::Create,
            ActionParams::Rename(_) => ActionKind::Rename,
            ActionParams::Modify(_) => ActionKind::Modify,
        }
    }

    /// The note the action is about (the old title for a rename).
    pub fn primary_title(&self) -> &str {
        match self {
            ActionParams::Create(p) => &p.title,
            ActionParams::Rename(p) => &p.old_title,
            ActionParams::Modify(p) => &p.title,
        }
    }

    /// One-line human summary, used in prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            ActionParams::Create(p) => format!("create note '{}'", p.title),
            ActionParams::Rename(p) => format!("rename '{}' to '{}'", p.old_title, p.new_title),
            ActionParams::Modify(p) => {
                let mut parts: Vec<String> = p
                    .updates
                    .iter()
                    .map(|u| match u.mode {
                        UpdateMode::Replace => format!("set {}", u.field),
                        UpdateMode::Append => format!("append to {}", u.field),
                    })
                    .collect();
                if !p.tags_to_add.is_empty() {
                    parts.push(format!("add tags {}", stringify_list(&p.tags_to_add)));
                }
                if !p.tags_to_remove.is_empty() {
                    parts.push(format!("remove tags {}", stringify_list(&p.tags_to_remove)));
                }
                format!("modify '{}': {}", p.title, parts.join(", "))
            }
        }
    }

    /// The changes this action declares it will make.
    pub fn default_intent(&self) -> Intent {
        match self {
            ActionParams::Create(p) => {
                let mut intent = Intent::new().update_field("text");
                for field in p.fields.keys() {
                    intent = intent.update_field(field);
                }
                for tag in &p.tags {
                    intent = intent.add_tag(tag);
                }
                intent
            }
            ActionParams::Rename(p) => Intent::new().delete(&p.old_title).update_field("list"),
            ActionParams::Modify(p) => {
                let mut intent = Intent::new();
                for update in &p.updates {
                    intent = intent.update_field(&update.field);
                }
                for tag in &p.tags_to_add {
                    intent = intent.add_tag(tag);
                }
                for tag in &p.tags_to_remove {
                    intent = intent.remove_tag(tag);
                }
                intent
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Created {
        title: String,
    },
    /// Create found the title taken; the caller should open it instead.
    AlreadyExists {
        title: String,
    },
    Renamed {
        from: String,
        to: String,
        /// Notes whose references were rewritten.
        relinked: Vec<String>,
    },
    Modified {
        title: String,
        fields: Vec<String>,
        tags_added: Vec<String>,
        tags_removed: Vec<String>,
    },
}

impl ActionOutcome {
    pub fn title(&self) -> &str {
        match self {
            ActionOutcome::Created { title }
            | ActionOutcome::AlreadyExists { title }
            | ActionOutcome::Modified { title, .. } => title,
            ActionOutcome::Renamed { to, .. } => to,
        }
    }

    /// Whether the store was changed.
    pub fn mutated(&self) -> bool {
        !matches!(self, ActionOutcome::AlreadyExists { .. })
    }

    pub fn message(&self) -> String {
        match self {
            ActionOutcome::Created { title } => format!("Created '{title}'"),
            ActionOutcome::AlreadyExists { title } => {
                format!("'{title}' already exists; opening it")
            }
            ActionOutcome::Renamed { from, to, relinked } => {
                format!(
                    "Renamed '{from}' to '{to}' ({} reference(s) updated)",
                    relinked.len()
                )
            }
            ActionOutcome::Modified { title, .. } => format!("Modified '{title}'"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{action} precondition failed: {reason}")]
    Precondition { action: ActionKind, reason: String },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Precondition { .. } => ErrorKind::ActionPrecondition,
            ActionError::InvalidParams(_) => ErrorKind::InvalidParams,
            ActionError::Store(_) => ErrorKind::StoreError,
        }
    }
}

type RuleCheck = fn(&dyn DocumentStore, &ActionParams) -> Result<(), ActionError>;

struct PreconditionRule {
    action: ActionKind,
    name: &'static str,
    check: RuleCheck,
}

const RULES: &[PreconditionRule] = &[
    PreconditionRule {
        action: ActionKind::Create,
        name: "title is well formed",
        check: create_title_valid,
    },
    PreconditionRule {
        action: ActionKind::Rename,
        name: "titles are well formed and distinct",
        check: rename_titles_valid,
    },
    PreconditionRule {
        action: ActionKind::Rename,
        name: "old title exists",
        check: rename_source_exists,
    },
    PreconditionRule {
        action: ActionKind::Rename,
        name: "new title is available",
        check: rename_target_available,
    },
    PreconditionRule {
        action: ActionKind::Modify,
        name: "changes are well formed",
        check: modify_params_valid,
    },
    PreconditionRule {
        action: ActionKind::Modify,
        name: "title exists",
        check: modify_target_exists,
    },
];

/// Names of the rules checked for `kind`, in evaluation order.
pub fn precondition_rules(kind: ActionKind) -> Vec<&'static str> {
    RULES
        .iter()
        .filter(|rule| rule.action == kind)
        .map(|rule| rule.name)
        .collect()
}

/// Run the rule table for `params` against the current store. Pure.
pub fn check_preconditions(
    store: &dyn DocumentStore,
    params: &ActionParams,
) -> Result<(), ActionError> {
    let kind = params.kind();
    for rule in RULES.iter().filter(|rule| rule.action == kind) {
        if let Err(err) = (rule.check)(store, params) {
            debug!(action = %kind, rule = rule.name, error = %err, "precondition failed");
            return Err(err);
        }
    }
    Ok(())
}

/// Characters that delimit links and transclusions; new titles may not use them.
const LINK_SYNTAX: &[char] = &['[', ']', '{', '}', '|'];

fn check_not_blank(title: &str) -> Result<(), ActionError> {
    if title.trim().is_empty() {
        return Err(ActionError::InvalidParams("title must not be empty".into()));
    }
    Ok(())
}

/// Rules for a title about to be written.
fn check_title(title: &str) -> Result<(), ActionError> {
    check_not_blank(title)?;
    if title != title.trim() {
        return Err(ActionError::InvalidParams(format!(
            "title '{title}' has leading or trailing whitespace"
        )));
    }
    if title.contains(LINK_SYNTAX) {
        return Err(ActionError::InvalidParams(format!(
            "title '{title}' contains link syntax"
        )));
    }
    Ok(())
}

fn create_title_valid(_store: &dyn DocumentStore, params: &ActionParams) -> Result<(), ActionError> {
    let ActionParams::Create(p) = params else {
        return Ok(());
    };
    check_title(&p.title)
}

fn rename_titles_valid(_store: &dyn DocumentStore, params: &ActionParams) -> Result<(), ActionError> {
    let ActionParams::Rename(p) = params else {
        return Ok(());
    };
    check_not_blank(&p.old_title)?;
    check_title(&p.new_title)?;
    if p.old_title == p.new_title {
        return Err(ActionError::InvalidParams(
            "old and new title are the same".into(),
        ));
    }
    Ok(())
}

fn rename_source_exists(store: &dyn DocumentStore, params: &ActionParams) -> Result<(), ActionError> {
    let ActionParams::Rename(p) = params else {
        return Ok(());
    };
    if store.exists(&p.old_title) {
        Ok(())
    } else {
        Err(ActionError::Precondition {
            action: ActionKind::Rename,
            reason: format!("'{}' does not exist", p.old_title),
        })
    }
}

fn rename_target_available(
    store: &dyn DocumentStore,
    params: &ActionParams,
) -> Result<(), ActionError> {
    let ActionParams::Rename(p) = params else {
        return Ok(());
    };
    if store.exists(&p.new_title) {
        Err(ActionError::Precondition {
            action: ActionKind::Rename,
            reason: format!("'{}' already exists", p.new_title),
        })
    } else {
        Ok(())
    }
}

fn modify_params_valid(_store: &dyn DocumentStore, params: &ActionParams) -> Result<(), ActionError> {
    let ActionParams::Modify(p) = params else {
        return Ok(());
    };
    check_not_blank(&p.title)?;
    if p.updates.is_empty() && p.tags_to_add.is_empty() && p.tags_to_remove.is_empty() {
        return Err(ActionError::InvalidParams("nothing to modify".into()));
    }
    for update in &p.updates {
        if update.field.trim().is_empty() {
            return Err(ActionError::InvalidParams("field name must not be empty".into()));
        }
        if RESERVED_FIELDS.contains(&update.field.as_str()) {
            return Err(ActionError::InvalidParams(format!(
                "field '{}' cannot be updated directly",
                update.field
            )));
        }
    }
    if let Some(tag) = p.tags_to_add.iter().find(|t| p.tags_to_remove.contains(t)) {
        return Err(ActionError::InvalidParams(format!(
            "tag '{tag}' is both added and removed"
        )));
    }
    Ok(())
}

fn modify_target_exists(store: &dyn DocumentStore, params: &ActionParams) -> Result<(), ActionError> {
    let ActionParams::Modify(p) = params else {
        return Ok(());
    };
    if store.exists(&p.title) {
        Ok(())
    } else {
        Err(ActionError::Precondition {
            action: ActionKind::Modify,
            reason: format!("'{}' does not exist", p.title),
        })
    }
}

/// Wiki timestamp (`YYYYMMDDhhmmssSSS`, UTC) for `ms` since the epoch.
pub fn wiki_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .format("%Y%m%d%H%M%S%3f")
        .to_string()
}

#[derive(Clone)]
pub struct ActionExecutor {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Every title `params` may write or delete, so a snapshot taken over
    /// them is enough to undo the action.
    pub fn affected_titles(&self, params: &ActionParams) -> Vec<String> {
        let mut titles: BTreeSet<String> = BTreeSet::new();
        match params {
            ActionParams::Create(p) => {
                titles.insert(p.title.clone());
            }
            ActionParams::Rename(p) => {
                titles.insert(p.old_title.clone());
                titles.insert(p.new_title.clone());
                titles.extend(self.store.links_referencing(&p.old_title));
                if self.store.exists(STORY_LIST_TITLE) {
                    titles.insert(STORY_LIST_TITLE.to_string());
                }
            }
            ActionParams::Modify(p) => {
                titles.insert(p.title.clone());
            }
        }
        titles.into_iter().collect()
    }

    pub fn execute(&self, params: &ActionParams) -> Result<ActionOutcome, ActionError> {
        check_preconditions(self.store.as_ref(), params)?;
        let outcome = match params {
            ActionParams::Create(p) => self.create(p)?,
            ActionParams::Rename(p) => self.rename(p)?,
            ActionParams::Modify(p) => self.modify(p)?,
        };
        info!(action = %params.kind(), title = outcome.title(), "action executed");
        Ok(outcome)
    }

    fn create(&self, p: &CreateParams) -> Result<ActionOutcome, ActionError> {
        if self.store.exists(&p.title) {
            debug!(title = %p.title, "create on existing title");
            return Ok(ActionOutcome::AlreadyExists {
                title: p.title.clone(),
            });
        }
        let now = wiki_timestamp(self.clock.now_ms());
        let mut fields: Fields = p.fields.clone();
        fields.insert("title".into(), p.title.clone());
        fields.insert("text".into(), p.text.clone());
        fields.remove("tags");
        if !p.tags.is_empty() {
            fields.insert("tags".into(), stringify_list(dedup(&p.tags)));
        }
        fields
            .entry("type".into())
            .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        fields.insert("created".into(), now.clone());
        fields.insert("modified".into(), now);
        self.store.put(&p.title, fields)?;
        Ok(ActionOutcome::Created {
            title: p.title.clone(),
        })
    }

    fn rename(&self, p: &RenameParams) -> Result<ActionOutcome, ActionError> {
        let Some(mut fields) = self.store.get(&p.old_title) else {
            return Err(ActionError::Precondition {
                action: ActionKind::Rename,
                reason: format!("'{}' does not exist", p.old_title),
            });
        };
        let now = wiki_timestamp(self.clock.now_ms());
        fields.insert("title".into(), p.new_title.clone());
        fields.insert("modified".into(), now.clone());
        self.store.put(&p.new_title, fields)?;

        let mut relinked = Vec::new();
        for title in self.store.links_referencing(&p.old_title) {
            if title == p.old_title {
                continue;
            }
            let Some(mut referrer) = self.store.get(&title) else {
                continue;
            };
            let Some(text) = referrer.get("text") else {
                continue;
            };
            let rewritten = rewrite_links(text, &p.old_title, &p.new_title);
            if &rewritten == text {
                continue;
            }
            referrer.insert("text".into(), rewritten);
            referrer.insert("modified".into(), now.clone());
            self.store.put(&title, referrer)?;
            relinked.push(title);
        }

        self.store.delete(&p.old_title)?;

        if let Some(mut story) = self.store.get(STORY_LIST_TITLE) {
            let list = parse_list(story.get("list").map(String::as_str).unwrap_or(""));
            if list.iter().any(|t| t == &p.old_title) {
                let replaced: Vec<String> = list
                    .into_iter()
                    .map(|t| {
                        if t == p.old_title {
                            p.new_title.clone()
                        } else {
                            t
                        }
                    })
                    .collect();
                story.insert("list".into(), stringify_list(dedup(&replaced)));
                self.store.put(STORY_LIST_TITLE, story)?;
            }
        }

        Ok(ActionOutcome::Renamed {
            from: p.old_title.clone(),
            to: p.new_title.clone(),
            relinked,
        })
    }

    fn modify(&self, p: &ModifyParams) -> Result<ActionOutcome, ActionError> {
        let Some(mut fields) = self.store.get(&p.title) else {
            return Err(ActionError::Precondition {
                action: ActionKind::Modify,
                reason: format!("'{}' does not exist", p.title),
            });
        };
        let mut changed_fields = Vec::new();
        for update in &p.updates {
            let value = match update.mode {
                UpdateMode::Replace => update.value.clone(),
                UpdateMode::Append => match fields.get(&update.field) {
                    Some(existing) if !existing.is_empty() => {
                        let sep = if update.field == "text" { "\n" } else { " " };
                        format!("{existing}{sep}{}", update.value)
                    }
                    _ => update.value.clone(),
                },
            };
            fields.insert(update.field.clone(), value);
            changed_fields.push(update.field.clone());
        }

        let before = parse_list(fields.get("tags").map(String::as_str).unwrap_or(""));
        let mut tags = before.clone();
        for tag in &p.tags_to_add {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags.retain(|tag| !p.tags_to_remove.contains(tag));
        let tags_added: Vec<String> = tags.iter().filter(|t| !before.contains(t)).cloned().collect();
        let tags_removed: Vec<String> =
            before.iter().filter(|t| !tags.contains(t)).cloned().collect();
        if tags.is_empty() {
            fields.remove("tags");
        } else {
            fields.insert("tags".into(), stringify_list(&tags));
        }

        fields.insert("modified".into(), wiki_timestamp(self.clock.now_ms()));
        self.store.put(&p.title, fields)?;
        Ok(ActionOutcome::Modified {
            title: p.title.clone(),
            fields: changed_fields,
            tags_added,
            tags_removed,
        })
    }
}

fn dedup(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
