use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::batch::{commit_all, partition_mutations, MutationSink};
use crate::config::BackfillConfig;
use crate::db::RecordSource;
use crate::error::CoreError;
use crate::fields::{build_search_update, removal_update};
use crate::types::{BackfillProgress, BackfillStats, FieldUpdate, PendingMutation, RawRecord};
use crate::util::now_ms;
use crate::CommandResult;

/// Receives run progress; the flag marks phase changes that must not be throttled.
pub(crate) type ProgressFn<'a> = dyn FnMut(&BackfillProgress, bool) + 'a;

/// Rewrites the normalized name, name tokens, and normalized aliases of every
/// record in `collection`.
pub(crate) async fn backfill_search_fields<S>(
    store: Arc<S>,
    collection: &str,
    config: &BackfillConfig,
    on_progress: &mut ProgressFn<'_>,
) -> CommandResult<BackfillStats>
where
    S: RecordSource + MutationSink,
{
    let token_lengths = config.token_lengths.clone();
    run_updates(store, collection, config, on_progress, move |record| {
        build_search_update(&record.fields, &token_lengths)
    })
    .await
}

/// Deletes `field` from every record in `collection`.
pub(crate) async fn remove_field<S>(
    store: Arc<S>,
    collection: &str,
    field: &str,
    config: &BackfillConfig,
    on_progress: &mut ProgressFn<'_>,
) -> CommandResult<BackfillStats>
where
    S: RecordSource + MutationSink,
{
    let field = field.trim().to_string();
    if field.is_empty() {
        return Err(CoreError::Configuration(
            "Field name to remove cannot be empty".to_string(),
        ));
    }
    run_updates(store, collection, config, on_progress, move |_| {
        removal_update(&field)
    })
    .await
}

async fn run_updates<S, F>(
    store: Arc<S>,
    collection: &str,
    config: &BackfillConfig,
    on_progress: &mut ProgressFn<'_>,
    derive: F,
) -> CommandResult<BackfillStats>
where
    S: RecordSource + MutationSink,
    F: Fn(&RawRecord) -> FieldUpdate + Send + Sync + 'static,
{
    config.validate()?;
    let started_at = now_ms();
    info!(collection, batch_capacity = config.batch_capacity, "starting collection run");

    let mut progress = BackfillProgress {
        collection: collection.to_string(),
        phase: "scanning".to_string(),
        scanned: 0,
        batches: 0,
        committed: 0,
        failed: 0,
        elapsed_ms: 0,
    };
    on_progress(&progress, true);

    let source = Arc::clone(&store);
    let source_collection = collection.to_string();
    let mutations = crate::async_runtime::spawn_blocking(move || {
        let records = source.records(&source_collection)?;
        let mutations = records
            .par_iter()
            .map(|record| PendingMutation {
                reference: record.reference.clone(),
                update: derive(record),
            })
            .collect::<Vec<PendingMutation>>();
        Ok::<_, CoreError>(mutations)
    })
    .await
    .map_err(|error| CoreError::Task(format!("Record scan task failed: {error}")))??;

    let scanned = mutations.len();
    progress.phase = "building".to_string();
    progress.scanned = scanned;
    on_progress(&progress, true);

    let batches = partition_mutations(mutations, config.batch_capacity)?;
    let batch_count = batches.len();
    progress.phase = "committing".to_string();
    progress.batches = batch_count;
    on_progress(&progress, true);

    let outcomes = commit_all(store, batches, config.max_concurrent_commits, |outcome| {
        if outcome.is_success() {
            progress.committed += 1;
        } else {
            progress.failed += 1;
        }
        on_progress(&progress, false);
    })
    .await;

    let (committed, failed): (Vec<_>, Vec<_>) =
        outcomes.into_iter().partition(|outcome| outcome.is_success());
    let elapsed_ms = now_ms() - started_at;

    progress.phase = "done".to_string();
    on_progress(&progress, true);

    if failed.is_empty() {
        info!(collection, scanned, batches = batch_count, elapsed_ms, "collection run finished");
    } else {
        warn!(
            collection,
            scanned,
            batches = batch_count,
            failed = failed.len(),
            elapsed_ms,
            "collection run finished with failed batches"
        );
    }

    if config.is_slow_run(elapsed_ms) {
        warn!(
            collection,
            scanned,
            batches = batch_count,
            elapsed_ms,
            threshold_ms = config.slow_run_warn_ms,
            "slow collection run"
        );
    }

    Ok(BackfillStats {
        collection: collection.to_string(),
        scanned,
        batches: batch_count,
        committed_batches: committed.len(),
        failed_batches: failed,
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MutationBatch;
    use crate::db::SqliteStore;
    use crate::fields::{NAME_TOKENS_FIELD, NORMALIZED_ALIASES_FIELD, NORMALIZED_NAME_FIELD};
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn test_store() -> (TempDir, Arc<SqliteStore>) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = SqliteStore::open(temp_dir.path().join("store.sqlite3"))
            .expect("Failed to open store");
        (temp_dir, Arc::new(store))
    }

    fn no_progress() -> impl FnMut(&BackfillProgress, bool) {
        |_, _| {}
    }

    #[tokio::test]
    async fn backfill_writes_search_fields() {
        let (_temp_dir, store) = test_store();
        store
            .put_records(
                "courses",
                &[(
                    "pranayama".to_string(),
                    fields(json!({
                        "name": { "en": "Pranayama", "ja": "プラナヤマ" },
                        "aliases": ["Prāṇāyāma"]
                    })),
                )],
            )
            .expect("Failed to seed");

        let stats = backfill_search_fields(
            Arc::clone(&store),
            "courses",
            &BackfillConfig::default(),
            &mut no_progress(),
        )
        .await
        .expect("run should succeed");

        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.committed_batches, 1);
        assert!(stats.failed_batches.is_empty());

        let record = store
            .get_record("courses", "pranayama")
            .expect("Failed to read")
            .expect("record should exist");
        assert_eq!(record.fields.get(NORMALIZED_NAME_FIELD), Some(&json!("pranayama")));
        assert_eq!(
            record.fields.get(NAME_TOKENS_FIELD).and_then(Value::as_array).map(Vec::len),
            Some(15)
        );
        assert_eq!(
            record.fields.get(NORMALIZED_ALIASES_FIELD),
            Some(&json!(["pranayama"]))
        );
    }

    #[tokio::test]
    async fn rerun_keeps_prior_aliases_when_source_has_none() {
        let (_temp_dir, store) = test_store();
        store
            .put_records(
                "courses",
                &[
                    (
                        "kept".to_string(),
                        fields(json!({ "name": "Yin Yoga", "aliasesNormalized": ["yin"] })),
                    ),
                    ("fresh".to_string(), fields(json!({ "name": "Hatha" }))),
                ],
            )
            .expect("Failed to seed");

        for _ in 0..2 {
            backfill_search_fields(
                Arc::clone(&store),
                "courses",
                &BackfillConfig::default(),
                &mut no_progress(),
            )
            .await
            .expect("run should succeed");
        }

        let kept = store
            .get_record("courses", "kept")
            .expect("Failed to read")
            .expect("record should exist");
        assert_eq!(kept.fields.get(NORMALIZED_ALIASES_FIELD), Some(&json!(["yin"])));
        assert_eq!(kept.fields.get(NORMALIZED_NAME_FIELD), Some(&json!("yin yoga")));

        let fresh = store
            .get_record("courses", "fresh")
            .expect("Failed to read")
            .expect("record should exist");
        assert_eq!(fresh.fields.get(NORMALIZED_ALIASES_FIELD), Some(&json!([])));
    }

    #[tokio::test]
    async fn every_record_is_visited_once_across_batches() {
        let (_temp_dir, store) = test_store();
        let records = (0..1001)
            .map(|index| {
                let id = format!("c-{index:04}");
                (id, fields(json!({ "name": format!("Course {index}") })))
            })
            .collect::<Vec<_>>();
        store.put_records("courses", &records).expect("Failed to seed");

        let mut phases = Vec::new();
        let stats = backfill_search_fields(
            Arc::clone(&store),
            "courses",
            &BackfillConfig::default(),
            &mut |progress: &BackfillProgress, force: bool| {
                if force {
                    phases.push(progress.phase.clone());
                }
            },
        )
        .await
        .expect("run should succeed");

        assert_eq!(stats.scanned, 1001);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.committed_batches, 3);
        assert_eq!(phases, vec!["scanning", "building", "committing", "done"]);

        let untouched = store
            .load_records("courses")
            .expect("Failed to load")
            .into_iter()
            .filter(|record| !record.fields.contains_key(NORMALIZED_NAME_FIELD))
            .count();
        assert_eq!(untouched, 0);
    }

    #[tokio::test]
    async fn empty_collection_runs_one_empty_batch() {
        let (_temp_dir, store) = test_store();
        let stats = backfill_search_fields(
            Arc::clone(&store),
            "courses",
            &BackfillConfig::default(),
            &mut no_progress(),
        )
        .await
        .expect("run should succeed");

        assert_eq!(stats.scanned, 0);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.committed_batches, 1);
    }

    #[tokio::test]
    async fn remove_field_deletes_only_that_field() {
        let (_temp_dir, store) = test_store();
        store
            .put_records(
                "courses",
                &[(
                    "c-1".to_string(),
                    fields(json!({ "name": "Yoga", "nameTokens": ["yo"], "nameNormalized": "yoga" })),
                )],
            )
            .expect("Failed to seed");

        let stats = remove_field(
            Arc::clone(&store),
            "courses",
            NAME_TOKENS_FIELD,
            &BackfillConfig::default(),
            &mut no_progress(),
        )
        .await
        .expect("run should succeed");
        assert_eq!(stats.scanned, 1);

        let record = store
            .get_record("courses", "c-1")
            .expect("Failed to read")
            .expect("record should exist");
        assert!(!record.fields.contains_key(NAME_TOKENS_FIELD));
        assert_eq!(record.fields.get(NORMALIZED_NAME_FIELD), Some(&json!("yoga")));
    }

    #[tokio::test]
    async fn blank_field_name_is_rejected() {
        let (_temp_dir, store) = test_store();
        let result = remove_field(
            store,
            "courses",
            "  ",
            &BackfillConfig::default(),
            &mut no_progress(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_scanning() {
        let (_temp_dir, store) = test_store();
        let mut calls = 0_usize;
        let result = backfill_search_fields(
            store,
            "courses",
            &BackfillConfig::default().batch_capacity(900),
            &mut |_: &BackfillProgress, _: bool| calls += 1,
        )
        .await;
        assert!(matches!(result, Err(CoreError::Configuration(_))));
        assert_eq!(calls, 0);
    }

    struct BrokenSource;

    impl RecordSource for BrokenSource {
        fn records(&self, _collection: &str) -> CommandResult<Vec<RawRecord>> {
            Err(CoreError::Task("scan cursor expired".to_string()))
        }
    }

    impl MutationSink for BrokenSource {
        fn commit_batch(&self, _batch: &MutationBatch) -> CommandResult<()> {
            panic!("no batch may be committed when enumeration fails");
        }
    }

    #[tokio::test]
    async fn enumeration_failure_is_fatal() {
        let result = backfill_search_fields(
            Arc::new(BrokenSource),
            "courses",
            &BackfillConfig::default(),
            &mut no_progress(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Task(ref message)) if message.contains("cursor")));
    }

    struct FlakySink {
        store: SqliteStore,
        failing_batch: usize,
    }

    impl RecordSource for FlakySink {
        fn records(&self, collection: &str) -> CommandResult<Vec<RawRecord>> {
            self.store.records(collection)
        }
    }

    impl MutationSink for FlakySink {
        fn commit_batch(&self, batch: &MutationBatch) -> CommandResult<()> {
            if batch.index() == self.failing_batch {
                return Err(CoreError::Task("quota exceeded".to_string()));
            }
            self.store.commit_batch(batch)
        }
    }

    #[tokio::test]
    async fn failed_batch_does_not_block_siblings() {
        let (_temp_dir, store) = test_store();
        let records = (0..10)
            .map(|index| (format!("c-{index}"), fields(json!({ "name": "Yoga" }))))
            .collect::<Vec<_>>();
        store.put_records("courses", &records).expect("Failed to seed");

        let sink = Arc::new(FlakySink {
            store: (*store).clone(),
            failing_batch: 1,
        });
        let stats = backfill_search_fields(
            sink,
            "courses",
            &BackfillConfig::default().batch_capacity(4),
            &mut no_progress(),
        )
        .await
        .expect("run should complete despite a failed batch");

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.committed_batches, 2);
        assert_eq!(stats.failed_batches.len(), 1);
        assert_eq!(stats.failed_batches[0].batch_index, 1);
        assert_eq!(stats.failed_batches[0].entry_count, 4);

        let updated = store
            .load_records("courses")
            .expect("Failed to load")
            .into_iter()
            .map(|record| record.fields.contains_key(NORMALIZED_NAME_FIELD))
            .collect::<Vec<bool>>();
        assert_eq!(
            updated,
            vec![true, true, true, true, false, false, false, false, true, true]
        );
    }
}
