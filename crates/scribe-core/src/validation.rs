//! Snapshot, verify and commit-or-rollback around a single mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{check_preconditions, ActionError, ActionParams};
use crate::clock::{Clock, SystemClock};
use crate::error::ErrorKind;
use crate::store::{DocumentStore, Fields, StoreError};
use crate::tags::parse_list;

pub type TransactionId = String;

/// Deep copy of the requested notes at one instant. Targets missing at
/// capture time are listed in `targets` but absent from `documents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub captured_at_ms: u64,
    pub targets: Vec<String>,
    pub documents: BTreeMap<String, Fields>,
}

impl StateSnapshot {
    pub fn get(&self, title: &str) -> Option<&Fields> {
        self.documents.get(title)
    }

    pub fn existed(&self, title: &str) -> bool {
        self.documents.contains_key(title)
    }
}

/// Changes a caller declares before mutating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub tags_to_add: BTreeSet<String>,
    #[serde(default)]
    pub tags_to_remove: BTreeSet<String>,
    #[serde(default)]
    pub fields_to_update: BTreeSet<String>,
    /// Titles that are expected to disappear.
    #[serde(default)]
    pub deletions: BTreeSet<String>,
}

impl Intent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags_to_add.insert(tag.into());
        self
    }

    pub fn remove_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags_to_remove.insert(tag.into());
        self
    }

    pub fn update_field(mut self, field: impl Into<String>) -> Self {
        self.fields_to_update.insert(field.into());
        self
    }

    pub fn delete(mut self, title: impl Into<String>) -> Self {
        self.deletions.insert(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    UnintendedDeletion { title: String },
    UnexpectedTagAdded { title: String, tag: String },
    UnexpectedTagRemoved { title: String, tag: String },
    UnexpectedFieldChange { title: String, field: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::UnintendedDeletion { title } => {
                write!(f, "'{title}' was deleted unexpectedly")
            }
            Violation::UnexpectedTagAdded { title, tag } => {
                write!(f, "tag '{tag}' was added to '{title}' unexpectedly")
            }
            Violation::UnexpectedTagRemoved { title, tag } => {
                write!(f, "tag '{tag}' was removed from '{title}' unexpectedly")
            }
            Violation::UnexpectedFieldChange { title, field } => {
                write!(f, "field '{field}' of '{title}' changed unexpectedly")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub violations: Vec<Violation>,
    /// Audit lines for accepted changes.
    pub changes: Vec<String>,
}

impl VerificationResult {
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

/// Which fields are free content and which are bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub content_fields: BTreeSet<String>,
    pub ignored_fields: BTreeSet<String>,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            content_fields: ["text"].into_iter().map(String::from).collect(),
            ignored_fields: ["modified", "modifier", "revision"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Transaction {
    targets: Vec<String>,
    snapshot: StateSnapshot,
    started_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("restoring transaction {id} failed: {source}")]
    Store {
        id: TransactionId,
        #[source]
        source: StoreError,
    },
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::NotFound(_) => ErrorKind::TransactionNotFound,
            TransactionError::Store { .. } => ErrorKind::StoreError,
        }
    }
}

pub struct ValidationService {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    policy: VerifyPolicy,
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
}

impl ValidationService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy: VerifyPolicy::default(),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: VerifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn capture_state(&self, targets: &[String]) -> StateSnapshot {
        let documents = targets
            .iter()
            .filter_map(|title| self.store.get(title).map(|fields| (title.clone(), fields)))
            .collect();
        StateSnapshot {
            captured_at_ms: self.clock.now_ms(),
            targets: targets.to_vec(),
            documents,
        }
    }

    pub fn begin_transaction(&self, targets: &[String]) -> TransactionId {
        let id = Uuid::new_v4().to_string();
        let snapshot = self.capture_state(targets);
        let tx = Transaction {
            targets: targets.to_vec(),
            started_at_ms: snapshot.captured_at_ms,
            snapshot,
        };
        self.transactions.lock().insert(id.clone(), tx);
        debug!(tx = %id, targets = ?targets, "transaction opened");
        id
    }

    /// Snapshot held by an open transaction.
    pub fn snapshot(&self, id: &str) -> Option<StateSnapshot> {
        self.transactions.lock().get(id).map(|tx| tx.snapshot.clone())
    }

    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Close the transaction, keeping the store as is. Returns the snapshot
    /// taken at begin so callers can record it for undo.
    pub fn commit_transaction(&self, id: &str) -> Result<StateSnapshot, TransactionError> {
        let tx = self
            .transactions
            .lock()
            .remove(id)
            .ok_or_else(|| TransactionError::NotFound(id.to_string()))?;
        info!(
            tx = %id,
            targets = tx.targets.len(),
            elapsed_ms = self.clock.now_ms().saturating_sub(tx.started_at_ms),
            "transaction committed"
        );
        Ok(tx.snapshot)
    }

    /// Restore the begin-time snapshot and close the transaction. The
    /// transaction is closed even when the restore fails.
    pub fn rollback_transaction(&self, id: &str) -> Result<(), TransactionError> {
        let tx = self
            .transactions
            .lock()
            .remove(id)
            .ok_or_else(|| TransactionError::NotFound(id.to_string()))?;
        match self.restore(&tx.snapshot) {
            Ok(()) => {
                info!(tx = %id, targets = tx.targets.len(), "transaction rolled back");
                Ok(())
            }
            Err(source) => {
                warn!(tx = %id, error = %source, "transaction rollback incomplete");
                Err(TransactionError::Store {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Write every snapshot document back verbatim and delete targets that
    /// did not exist. Keeps going after a failure; returns the first error.
    pub fn restore(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let mut first_err: Option<StoreError> = None;
        for title in &snapshot.targets {
            let result = match snapshot.documents.get(title) {
                Some(fields) => self.store.put(title, fields.clone()),
                None if self.store.exists(title) => self.store.delete(title),
                None => Ok(()),
            };
            if let Err(err) = result {
                warn!(%title, error = %err, "restore step failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn verify_state(
        &self,
        before: &StateSnapshot,
        after: &StateSnapshot,
        intent: &Intent,
    ) -> VerificationResult {
        let mut result = VerificationResult::default();
        for (title, old) in &before.documents {
            let Some(new) = after.documents.get(title) else {
                if intent.deletions.contains(title) {
                    result.changes.push(format!("deleted '{title}'"));
                } else {
                    result.violations.push(Violation::UnintendedDeletion {
                        title: title.clone(),
                    });
                }
                continue;
            };
            let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for field in names {
                let was = old.get(field);
                let now = new.get(field);
                if was == now || self.policy.ignored_fields.contains(field) {
                    continue;
                }
                if field == "tags" {
                    self.diff_tags(title, was, now, intent, &mut result);
                } else if self.policy.content_fields.contains(field)
                    || intent.fields_to_update.contains(field)
                {
                    result.changes.push(format!("updated '{field}' of '{title}'"));
                } else {
                    result.violations.push(Violation::UnexpectedFieldChange {
                        title: title.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        for title in after.documents.keys() {
            if !before.existed(title) && before.targets.contains(title) {
                result.changes.push(format!("created '{title}'"));
            }
        }
        result.success = result.violations.is_empty();
        if !result.success {
            debug!(violations = result.violations.len(), "verification failed");
        }
        result
    }

    fn diff_tags(
        &self,
        title: &str,
        was: Option<&String>,
        now: Option<&String>,
        intent: &Intent,
        result: &mut VerificationResult,
    ) {
        let old: BTreeSet<String> = parse_list(was.map(String::as_str).unwrap_or(""))
            .into_iter()
            .collect();
        let new: BTreeSet<String> = parse_list(now.map(String::as_str).unwrap_or(""))
            .into_iter()
            .collect();
        for tag in new.difference(&old) {
            if intent.tags_to_add.contains(tag) {
                result.changes.push(format!("tagged '{title}' with '{tag}'"));
            } else {
                result.violations.push(Violation::UnexpectedTagAdded {
                    title: title.to_string(),
                    tag: tag.clone(),
                });
            }
        }
        for tag in old.difference(&new) {
            if intent.tags_to_remove.contains(tag) {
                result.changes.push(format!("untagged '{title}' from '{tag}'"));
            } else {
                result.violations.push(Violation::UnexpectedTagRemoved {
                    title: title.to_string(),
                    tag: tag.clone(),
                });
            }
        }
    }

    /// Rule-table pre-check; never mutates the store.
    pub fn validate_action(&self, params: &ActionParams) -> Result<(), ActionError> {
        check_preconditions(self.store.as_ref(), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ModifyParams, RenameParams};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn doc(title: &str, text: &str, tags: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), title.into());
        fields.insert("text".into(), text.into());
        if !tags.is_empty() {
            fields.insert("tags".into(), tags.into());
        }
        fields
    }

    fn service(docs: Vec<Fields>) -> (Arc<MemoryStore>, ValidationService) {
        let store = Arc::new(MemoryStore::from_documents(docs));
        let svc = ValidationService::new(store.clone()).with_clock(Arc::new(ManualClock::new(7)));
        (store, svc)
    }

    fn titles(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn capture_omits_missing_documents() {
        let (_store, svc) = service(vec![doc("A", "a", "")]);
        let snap = svc.capture_state(&titles(&["A", "Missing"]));
        assert_eq!(snap.captured_at_ms, 7);
        assert_eq!(snap.targets, titles(&["A", "Missing"]));
        assert!(snap.existed("A"));
        assert!(!snap.existed("Missing"));
    }

    #[test]
    fn detects_tag_outside_intent() {
        let (store, svc) = service(vec![doc("A", "a", "one")]);
        let before = svc.capture_state(&titles(&["A"]));
        store.put("A", doc("A", "a", "one sneaky")).unwrap();
        let after = svc.capture_state(&titles(&["A"]));

        let result = svc.verify_state(&before, &after, &Intent::new().add_tag("x"));
        assert!(!result.success);
        assert_eq!(
            result.violations,
            vec![Violation::UnexpectedTagAdded {
                title: "A".into(),
                tag: "sneaky".into()
            }]
        );
        assert!(result.messages()[0].contains("sneaky"));
    }

    #[test]
    fn accepts_declared_tag_and_content_changes() {
        let (store, svc) = service(vec![doc("A", "a", "one")]);
        let before = svc.capture_state(&titles(&["A"]));
        let mut changed = doc("A", "rewritten", "one x");
        changed.insert("modified".into(), "20240101000000000".into());
        store.put("A", changed).unwrap();
        let after = svc.capture_state(&titles(&["A"]));

        let result = svc.verify_state(&before, &after, &Intent::new().add_tag("x"));
        assert!(result.success, "{:?}", result.violations);
        assert_eq!(result.changes.len(), 2);
    }

    #[test]
    fn flags_undeclared_fields_and_deletions() {
        let (store, svc) = service(vec![doc("A", "a", ""), doc("B", "b", "")]);
        let targets = titles(&["A", "B"]);
        let before = svc.capture_state(&targets);
        let mut a = doc("A", "a", "");
        a.insert("color".into(), "red".into());
        store.put("A", a).unwrap();
        store.delete("B").unwrap();
        let after = svc.capture_state(&targets);

        let result = svc.verify_state(&before, &after, &Intent::new());
        assert_eq!(result.violations.len(), 2);
        assert!(result
            .violations
            .contains(&Violation::UnintendedDeletion { title: "B".into() }));

        let declared = Intent::new().update_field("color").delete("B");
        assert!(svc.verify_state(&before, &after, &declared).success);
    }

    #[test]
    fn rollback_restores_and_removes_created_targets() {
        let (store, svc) = service(vec![doc("A", "original", "t")]);
        let id = svc.begin_transaction(&titles(&["A", "New"]));
        store.put("A", doc("A", "changed", "")).unwrap();
        store.put("New", doc("New", "fresh", "")).unwrap();

        svc.rollback_transaction(&id).unwrap();
        assert_eq!(store.get("A").unwrap(), doc("A", "original", "t"));
        assert!(!store.exists("New"));
        assert_eq!(svc.open_transactions(), 0);
    }

    #[test]
    fn terminated_transactions_are_not_found() {
        let (_store, svc) = service(vec![doc("A", "a", "")]);
        let id = svc.begin_transaction(&titles(&["A"]));
        let snap = svc.commit_transaction(&id).unwrap();
        assert!(snap.existed("A"));

        let err = svc.commit_transaction(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionNotFound);
        assert!(matches!(
            svc.rollback_transaction(&id),
            Err(TransactionError::NotFound(_))
        ));
        assert!(matches!(
            svc.rollback_transaction("never-issued"),
            Err(TransactionError::NotFound(_))
        ));
    }

    #[test]
    fn validate_action_runs_rule_table_without_mutating() {
        let (store, svc) = service(vec![doc("A", "a", "")]);
        let rename = ActionParams::Rename(RenameParams {
            old_title: "A".into(),
            new_title: "B".into(),
        });
        svc.validate_action(&rename).unwrap();
        assert!(store.exists("A") && !store.exists("B"));

        let modify = ActionParams::Modify(ModifyParams {
            title: "Ghost".into(),
            tags_to_add: vec!["x".into()],
            ..ModifyParams::default()
        });
        assert_eq!(
            svc.validate_action(&modify).unwrap_err().kind(),
            ErrorKind::ActionPrecondition
        );
    }
}
