mod common;

use std::sync::Arc;

use common::{doc, FixedValidator, FlakyStore};
use scribe_core::{
    ActionOutcome, ActionParams, CacheConfig, CachedSearch, CoordinatorConfig, DocumentStore,
    ErrorKind, FailureStage, Intent, ManualClock, MemoryStore, ModifyParams, OperationRequest,
    QueryCache, RenameParams, ServiceCoordinator, ValidationVerdict,
};

fn tag_request(title: &str, tag: &str) -> OperationRequest {
    OperationRequest::new(ActionParams::Modify(ModifyParams {
        title: title.into(),
        tags_to_add: vec![tag.into()],
        ..ModifyParams::default()
    }))
}

fn rename_request(old: &str, new: &str) -> OperationRequest {
    OperationRequest::new(ActionParams::Rename(RenameParams {
        old_title: old.into(),
        new_title: new.into(),
    }))
}

#[tokio::test]
async fn failed_write_midway_leaves_store_untouched() {
    let store = FlakyStore::with_documents(vec![
        doc("Old", "target", "keep"),
        doc("Linker", "see [[Old]]", ""),
        doc("Other", "also {{Old}}", ""),
    ]);
    let before: Vec<_> = store.list().iter().map(|t| store.get(t)).collect();
    store.fail_next_put_to("Other");

    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default());
    let failure = coord
        .execute_operation(rename_request("Old", "New"))
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::Execution);
    assert_eq!(failure.kind, ErrorKind::StoreError);
    assert!(failure.rollback_error.is_none());

    let after: Vec<_> = store.list().iter().map(|t| store.get(t)).collect();
    assert_eq!(after, before);
    assert!(!store.exists("New"));
    assert!(coord.history().await.is_empty());
    assert_eq!(coord.validation().open_transactions(), 0);
}

#[tokio::test]
async fn rollback_failure_is_reported() {
    let store = FlakyStore::with_documents(vec![doc("A", "x", "")]);
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default());
    // the modify write lands, verification rejects it, the restore write is refused
    store.fail_writes_after(1);
    let failure = coord
        .execute_operation(tag_request("A", "surprise").with_intent(Intent::new()))
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::PostValidation);
    assert_eq!(failure.kind, ErrorKind::ValidationViolation);
    assert!(failure
        .violations
        .iter()
        .any(|v| v.to_string().contains("surprise")));
    let rollback_error = failure.rollback_error.expect("rollback failure reported");
    assert!(rollback_error.contains("write budget exhausted"));
    assert_eq!(coord.validation().open_transactions(), 0);
}

#[tokio::test]
async fn undo_without_count_reverts_whole_query_in_reverse_order() {
    let store = Arc::new(MemoryStore::from_documents([doc("Note", "v0", "")]));
    let clock = ManualClock::new(5_000);
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default())
        .with_clock(Arc::new(clock.clone()));
    let pristine = store.get("Note").unwrap();

    coord.execute_operation(tag_request("Note", "a1")).await.unwrap();
    clock.advance(1);
    coord.execute_operation(tag_request("Note", "a2")).await.unwrap();
    clock.advance(1);
    coord
        .execute_operation(rename_request("Note", "Renamed"))
        .await
        .unwrap();
    assert!(store.exists("Renamed"));

    let report = coord.undo_multiple_actions(None).await;
    assert!(report.failure.is_none());
    let order: Vec<String> = report
        .undone
        .iter()
        .map(|e| e.params.describe())
        .collect();
    assert_eq!(
        order,
        vec![
            "rename 'Note' to 'Renamed'".to_string(),
            "modify 'Note': add tags a2".to_string(),
            "modify 'Note': add tags a1".to_string(),
        ]
    );
    assert_eq!(store.get("Note").unwrap(), pristine);
    assert!(!store.exists("Renamed"));
    assert_eq!(coord.query_in_progress().await, None);
}

#[tokio::test]
async fn undo_without_count_stops_at_previous_query() {
    let store = Arc::new(MemoryStore::from_documents([doc("Note", "", "")]));
    let clock = ManualClock::new(0);
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default())
        .with_clock(Arc::new(clock.clone()));

    coord.execute_operation(tag_request("Note", "earlier")).await.unwrap();
    coord.complete_query().await;
    clock.advance(100);
    coord.execute_operation(tag_request("Note", "later")).await.unwrap();
    coord.execute_operation(tag_request("Note", "latest")).await.unwrap();

    let report = coord.undo_multiple_actions(None).await;
    assert_eq!(report.count(), 2);
    assert_eq!(store.get("Note").unwrap()["tags"], "earlier");

    // with no query in progress the most recent one is undone
    let report = coord.undo_multiple_actions(None).await;
    assert_eq!(report.count(), 1);
    assert!(store.get("Note").unwrap().get("tags").is_none());
}

#[tokio::test]
async fn explicit_count_crosses_queries_and_stops_on_failure() {
    let store = FlakyStore::with_documents(vec![doc("Note", "", "")]);
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default());
    for tag in ["one", "two", "three"] {
        coord.execute_operation(tag_request("Note", tag)).await.unwrap();
        coord.complete_query().await;
    }

    let report = coord.undo_multiple_actions(Some(2)).await;
    assert_eq!(report.count(), 2);
    assert_eq!(store.get("Note").unwrap()["tags"], "one");

    store.fail_all_writes(true);
    let err = coord.undo_last_action().await.unwrap_err();
    assert_eq!(err.stage, FailureStage::Undo);
    assert_eq!(coord.history().await.len(), 1, "failed undo keeps the entry");

    store.fail_all_writes(false);
    coord.undo_last_action().await.unwrap();
    assert!(coord.history().await.is_empty());
}

#[tokio::test]
async fn validator_runs_once_per_query_and_rejection_blocks_mutation() {
    let store = Arc::new(MemoryStore::from_documents([doc("Note", "", "")]));
    let approve = FixedValidator::new(ValidationVerdict::approve());
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default())
        .with_validator(approve.clone());
    coord
        .execute_operation(tag_request("Note", "a").with_user_request("tag it"))
        .await
        .unwrap();
    coord.execute_operation(tag_request("Note", "b")).await.unwrap();
    assert_eq!(approve.calls(), 1);
    assert_eq!(approve.calls.lock()[0].user_request, "tag it");

    let reject = FixedValidator::new(
        ValidationVerdict::reject("the user asked about recipes").with_suggestion("open Recipes"),
    );
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default())
        .with_validator(reject);
    let failure = coord
        .execute_operation(tag_request("Note", "c"))
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::PreValidation);
    assert_eq!(failure.kind, ErrorKind::ValidatorRejected);
    assert_eq!(failure.suggestions, vec!["open Recipes"]);
    assert_eq!(store.get("Note").unwrap()["tags"], "a b");
    assert_eq!(coord.query_in_progress().await, None);
}

#[tokio::test]
async fn committed_mutations_clear_cached_searches() {
    let store = Arc::new(MemoryStore::from_documents([doc("Garden", "beans", "")]));
    let cache = Arc::new(QueryCache::new(CacheConfig::default()));
    let search = CachedSearch::new(store.clone(), cache.clone());
    let coord = ServiceCoordinator::new(store.clone(), CoordinatorConfig::default())
        .with_cache(cache.clone());

    assert_eq!(search.search("garden", &[]), vec!["Garden"]);
    assert_eq!(cache.len(), 1);

    let done = coord
        .execute_operation(rename_request("Garden", "Orchard"))
        .await
        .unwrap();
    assert!(matches!(done.outcome, ActionOutcome::Renamed { .. }));
    assert!(cache.is_empty());
    assert!(search.search("garden", &[]).is_empty());
    assert_eq!(search.search("orchard", &[]), vec!["Orchard"]);
}
