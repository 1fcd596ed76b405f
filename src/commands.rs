use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::BackfillConfig;
use crate::db::{database_path, SqliteStore};
use crate::error::CoreError;
use crate::fields::{build_search_update, normalize_value};
use crate::indexer;
use crate::runtime::AppHandle;
use crate::search::{self, DEFAULT_TOKEN_LENGTHS};
use crate::types::{BackfillProgress, BackfillStats, FieldUpdate, RawRecord};
use crate::util::{emit_backfill_progress, now_ms};
use crate::CommandResult;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RecordInput {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

fn open_store(app: &AppHandle) -> CommandResult<SqliteStore> {
    SqliteStore::open(database_path(app)?)
}

fn require_name<'a>(label: &str, value: &'a str) -> CommandResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Configuration(format!("{label} cannot be empty")));
    }
    Ok(trimmed)
}

fn token_lengths_or_default(lengths: Option<Vec<usize>>) -> Vec<usize> {
    lengths
        .filter(|lengths| !lengths.is_empty())
        .unwrap_or_else(|| DEFAULT_TOKEN_LENGTHS.to_vec())
}

pub(crate) fn normalize_text(text: Value) -> String {
    normalize_value(Some(&text))
}

pub(crate) fn derive_tokens(text: String, lengths: Option<Vec<usize>>) -> Vec<String> {
    search::derive_tokens(&text, &token_lengths_or_default(lengths))
        .into_iter()
        .collect()
}

pub(crate) fn build_field_update(
    record: Map<String, Value>,
    token_lengths: Option<Vec<usize>>,
) -> FieldUpdate {
    build_search_update(&record, &token_lengths_or_default(token_lengths))
}

pub(crate) fn put_records(
    app: AppHandle,
    collection: String,
    records: Vec<RecordInput>,
) -> CommandResult<usize> {
    let collection = require_name("Collection name", &collection)?;
    let records = records
        .into_iter()
        .map(|record| Ok((require_name("Record id", &record.id)?.to_string(), record.fields)))
        .collect::<CommandResult<Vec<(String, Map<String, Value>)>>>()?;
    open_store(&app)?.put_records(collection, &records)
}

pub(crate) fn get_record(
    app: AppHandle,
    collection: String,
    id: String,
) -> CommandResult<Option<RawRecord>> {
    open_store(&app)?.get_record(collection.trim(), id.trim())
}

pub(crate) async fn backfill_search_fields(
    app: AppHandle,
    collection: String,
    config: Option<BackfillConfig>,
) -> CommandResult<BackfillStats> {
    let collection = require_name("Collection name", &collection)?;
    let store = Arc::new(open_store(&app)?);
    let config = config.unwrap_or_default();

    let started_at = now_ms();
    let mut last_emitted_ms = 0_i64;
    let mut on_progress = |progress: &BackfillProgress, force: bool| {
        emit_backfill_progress(&app, started_at, progress, &mut last_emitted_ms, force);
    };

    indexer::backfill_search_fields(store, collection, &config, &mut on_progress).await
}

pub(crate) async fn remove_field(
    app: AppHandle,
    collection: String,
    field: String,
    config: Option<BackfillConfig>,
) -> CommandResult<BackfillStats> {
    let collection = require_name("Collection name", &collection)?;
    let store = Arc::new(open_store(&app)?);
    let config = config.unwrap_or_default();

    let started_at = now_ms();
    let mut last_emitted_ms = 0_i64;
    let mut on_progress = |progress: &BackfillProgress, force: bool| {
        emit_backfill_progress(&app, started_at, progress, &mut last_emitted_ms, force);
    };

    indexer::remove_field(store, collection, &field, &config, &mut on_progress).await
}
