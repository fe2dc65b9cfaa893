//! Runs one user-triggered mutation end to end and keeps the undo log.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::actions::{ActionExecutor, ActionKind, ActionOutcome, ActionParams};
use crate::cache::QueryCache;
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::ErrorKind;
use crate::notify::{NoticeKind, Notifier, TracingNotifier};
use crate::store::DocumentStore;
use crate::validation::{Intent, StateSnapshot, ValidationService, Violation};
use crate::validator::{ActionValidator, ValidationRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub params: ActionParams,
    /// Declared changes; derived from `params` when absent.
    pub intent: Option<Intent>,
    /// The user's words, passed to the remote validator.
    pub user_request: Option<String>,
}

impl OperationRequest {
    pub fn new(params: ActionParams) -> Self {
        Self {
            params,
            intent: None,
            user_request: None,
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_user_request(mut self, text: impl Into<String>) -> Self {
        self.user_request = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Before any mutation: rule table or remote validator.
    PreValidation,
    Execution,
    /// The mutation ran but touched more than declared.
    PostValidation,
    Commit,
    Undo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub kind: ErrorKind,
    pub stage: FailureStage,
    pub message: String,
    pub suggestions: Vec<String>,
    pub violations: Vec<Violation>,
    /// Set when restoring the snapshot also failed.
    pub rollback_error: Option<String>,
}

impl OperationFailure {
    fn new(kind: ErrorKind, stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            suggestions: Vec::new(),
            violations: Vec::new(),
            rollback_error: None,
        }
    }
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for OperationFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSuccess {
    pub outcome: ActionOutcome,
    /// Accepted changes reported by verification.
    pub changes: Vec<String>,
    pub query_started_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHistoryEntry {
    pub action: ActionKind,
    pub params: ActionParams,
    /// State of every affected note before the action ran.
    pub snapshot: StateSnapshot,
    pub timestamp_ms: u64,
    pub query_started_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoReport {
    /// Entries undone, most recent first.
    pub undone: Vec<ActionHistoryEntry>,
    pub failure: Option<OperationFailure>,
}

impl UndoReport {
    pub fn count(&self) -> usize {
        self.undone.len()
    }
}

#[derive(Default)]
struct CoordinatorState {
    history: VecDeque<ActionHistoryEntry>,
    query_started_at_ms: Option<u64>,
}

pub struct ServiceCoordinator {
    executor: ActionExecutor,
    validation: ValidationService,
    validator: Option<Arc<dyn ActionValidator>>,
    notifier: Arc<dyn Notifier>,
    cache: Option<Arc<QueryCache>>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    // Held for a whole operation: coordinator calls are serialized.
    state: Mutex<CoordinatorState>,
}

impl ServiceCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, config: CoordinatorConfig) -> Self {
        Self {
            executor: ActionExecutor::new(store.clone()),
            validation: ValidationService::new(store),
            validator: None,
            notifier: Arc::new(TracingNotifier),
            cache: None,
            clock: Arc::new(SystemClock),
            config,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ActionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Cache cleared after every committed mutation and undo.
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.executor = self.executor.with_clock(clock.clone());
        self.validation = self.validation.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn validation(&self) -> &ValidationService {
        &self.validation
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub async fn execute_operation(
        &self,
        request: OperationRequest,
    ) -> Result<OperationSuccess, OperationFailure> {
        let mut state = self.state.lock().await;
        let params = &request.params;
        let kind = params.kind();

        if let Err(err) = self.validation.validate_action(params) {
            let failure =
                OperationFailure::new(err.kind(), FailureStage::PreValidation, err.to_string());
            return Err(self.report(failure));
        }

        if state.query_started_at_ms.is_none() && self.config.validate_first_action {
            if let Some(validator) = &self.validator {
                let vreq =
                    ValidationRequest::new(request.user_request.clone().unwrap_or_default(), params);
                match validator.validate(&vreq).await {
                    Ok(verdict) if verdict.valid => {}
                    Ok(verdict) => {
                        state.query_started_at_ms = None;
                        let mut failure = OperationFailure::new(
                            ErrorKind::ValidatorRejected,
                            FailureStage::PreValidation,
                            verdict
                                .reason
                                .unwrap_or_else(|| format!("{} rejected by validator", kind)),
                        );
                        failure.suggestions = verdict.suggestions;
                        return Err(self.report(failure));
                    }
                    Err(err) => {
                        state.query_started_at_ms = None;
                        let failure = OperationFailure::new(
                            err.kind(),
                            FailureStage::PreValidation,
                            err.to_string(),
                        );
                        return Err(self.report(failure));
                    }
                }
            }
        }
        let query_started_at_ms = *state
            .query_started_at_ms
            .get_or_insert_with(|| self.clock.now_ms());

        let targets = self.executor.affected_titles(params);
        let tx = self.validation.begin_transaction(&targets);
        let before = self
            .validation
            .snapshot(&tx)
            .unwrap_or_else(|| self.validation.capture_state(&targets));

        let outcome = match self.executor.execute(params) {
            Ok(outcome) => outcome,
            Err(err) => {
                let mut failure =
                    OperationFailure::new(err.kind(), FailureStage::Execution, err.to_string());
                failure.rollback_error = self.rollback(&tx);
                return Err(self.report(failure));
            }
        };

        if !outcome.mutated() {
            if let Err(err) = self.validation.commit_transaction(&tx) {
                warn!(tx = %tx, error = %err, "closing no-op transaction failed");
            }
            self.notifier.display(NoticeKind::Info, &outcome.message());
            return Ok(OperationSuccess {
                outcome,
                changes: Vec::new(),
                query_started_at_ms,
            });
        }

        let after = self.validation.capture_state(&targets);
        let intent = request
            .intent
            .clone()
            .unwrap_or_else(|| params.default_intent());
        let verification = self.validation.verify_state(&before, &after, &intent);
        if !verification.success {
            let mut failure = OperationFailure::new(
                ErrorKind::ValidationViolation,
                FailureStage::PostValidation,
                verification.messages().join("; "),
            );
            failure.violations = verification.violations;
            failure.rollback_error = self.rollback(&tx);
            return Err(self.report(failure));
        }

        let snapshot = match self.validation.commit_transaction(&tx) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let mut failure =
                    OperationFailure::new(err.kind(), FailureStage::Commit, err.to_string());
                failure.rollback_error = self.validation.restore(&before).err().map(|e| e.to_string());
                return Err(self.report(failure));
            }
        };

        state.history.push_back(ActionHistoryEntry {
            action: kind,
            params: params.clone(),
            snapshot,
            timestamp_ms: self.clock.now_ms(),
            query_started_at_ms,
        });
        while state.history.len() > self.config.max_history {
            state.history.pop_front();
        }
        self.invalidate_cache();
        info!(
            action = %kind,
            title = outcome.title(),
            history = state.history.len(),
            "operation committed"
        );
        self.notifier.display(NoticeKind::Success, &outcome.message());
        Ok(OperationSuccess {
            outcome,
            changes: verification.changes,
            query_started_at_ms,
        })
    }

    pub async fn undo_last_action(&self) -> Result<ActionHistoryEntry, OperationFailure> {
        let mut state = self.state.lock().await;
        state.query_started_at_ms = None;
        match self.undo_one_locked(&mut state) {
            Ok(entry) => {
                self.invalidate_cache();
                self.notifier
                    .display(NoticeKind::Success, &format!("Undid {}", entry.params.describe()));
                Ok(entry)
            }
            Err(failure) => Err(self.report(failure)),
        }
    }

    /// Undo `count` actions, or with `None` every action of the current query
    /// (the most recent query when none is in progress). Stops at the first
    /// failure.
    pub async fn undo_multiple_actions(&self, count: Option<usize>) -> UndoReport {
        let mut state = self.state.lock().await;
        let query = match count {
            Some(_) => None,
            None => state
                .query_started_at_ms
                .or_else(|| state.history.back().map(|e| e.query_started_at_ms)),
        };
        state.query_started_at_ms = None;

        let mut report = UndoReport::default();
        loop {
            match count {
                Some(n) if report.undone.len() >= n => break,
                Some(_) => {}
                None => match state.history.back() {
                    Some(entry) if Some(entry.query_started_at_ms) == query => {}
                    _ => break,
                },
            }
            if state.history.is_empty() {
                break;
            }
            match self.undo_one_locked(&mut state) {
                Ok(entry) => report.undone.push(entry),
                Err(failure) => {
                    report.failure = Some(self.report(failure));
                    break;
                }
            }
        }
        if report.undone.is_empty() && report.failure.is_none() {
            report.failure = Some(self.report(OperationFailure::new(
                ErrorKind::NothingToUndo,
                FailureStage::Undo,
                "nothing to undo",
            )));
        }
        if !report.undone.is_empty() {
            self.invalidate_cache();
            self.notifier.display(
                NoticeKind::Success,
                &format!("Undid {} action(s)", report.undone.len()),
            );
        }
        info!(undone = report.undone.len(), failed = report.failure.is_some(), "undo finished");
        report
    }

    /// Mark the end of a user turn; the next action starts a new query.
    pub async fn complete_query(&self) {
        self.state.lock().await.query_started_at_ms = None;
    }

    pub async fn query_in_progress(&self) -> Option<u64> {
        self.state.lock().await.query_started_at_ms
    }

    pub async fn history(&self) -> Vec<ActionHistoryEntry> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    fn undo_one_locked(
        &self,
        state: &mut CoordinatorState,
    ) -> Result<ActionHistoryEntry, OperationFailure> {
        let Some(entry) = state.history.pop_back() else {
            return Err(OperationFailure::new(
                ErrorKind::NothingToUndo,
                FailureStage::Undo,
                "nothing to undo",
            ));
        };
        match self.validation.restore(&entry.snapshot) {
            Ok(()) => {
                info!(action = %entry.action, title = entry.params.primary_title(), "action undone");
                Ok(entry)
            }
            Err(err) => {
                let failure = OperationFailure::new(
                    ErrorKind::StoreError,
                    FailureStage::Undo,
                    format!("undo of {} failed: {err}", entry.params.describe()),
                );
                state.history.push_back(entry);
                Err(failure)
            }
        }
    }

    fn rollback(&self, tx: &str) -> Option<String> {
        match self.validation.rollback_transaction(tx) {
            Ok(()) => None,
            Err(err) => {
                error!(tx, error = %err, "rollback failed");
                Some(err.to_string())
            }
        }
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    fn report(&self, failure: OperationFailure) -> OperationFailure {
        warn!(
            kind = %failure.kind,
            stage = ?failure.stage,
            message = %failure.message,
            "operation failed"
        );
        self.notifier.display(NoticeKind::Error, &failure.message);
        failure
    }
}
