use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};

use crate::batch::{MutationBatch, MutationSink};
use crate::error::{db_error, CoreError};
use crate::runtime::AppHandle;
use crate::types::{RawRecord, RecordRef};
use crate::util::{now_ms, path_display};
use crate::CommandResult;

const DATABASE_FILE_NAME: &str = "catalog-store-v1.sqlite3";
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn database_path(app: &AppHandle) -> CommandResult<PathBuf> {
    let data_dir = app.data_dir();
    fs::create_dir_all(data_dir)?;
    Ok(data_dir.join(DATABASE_FILE_NAME))
}

/// Enumerates the records of a collection.
///
/// Iteration order must be stable between calls so batch assignment is
/// reproducible for the same data.
pub trait RecordSource: Send + Sync + 'static {
    fn records(&self, collection: &str) -> CommandResult<Vec<RawRecord>>;
}

fn connect(db_path: &Path) -> CommandResult<Connection> {
    let connection = Connection::open(db_path).map_err(db_error(format!(
        "Could not open database '{}'",
        path_display(db_path)
    )))?;
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .map_err(db_error("Could not set busy timeout"))?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> CommandResult<()> {
    connection
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
        .map_err(db_error("Could not set journal mode"))?;

    connection
        .execute_batch(
            "
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS records (
              collection TEXT NOT NULL,
              record_id TEXT NOT NULL,
              fields_json TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(collection, record_id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);
            ",
        )
        .map_err(db_error("Could not initialize record store"))?;

    Ok(())
}

fn parse_fields(raw: &str) -> CommandResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Map::new()),
    }
}

/// Document store kept in a single SQLite file.
///
/// Each record is a JSON object keyed by `(collection, record_id)`. Every call
/// opens its own connection, so the store can be shared across threads.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: impl Into<PathBuf>) -> CommandResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let connection = connect(&db_path)?;
        initialize_schema(&connection)?;
        Ok(Self { db_path })
    }

    /// Inserts or replaces records, keeping the position of existing ones.
    pub fn put_records(
        &self,
        collection: &str,
        records: &[(String, Map<String, Value>)],
    ) -> CommandResult<usize> {
        let mut connection = connect(&self.db_path)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error("Could not start import transaction"))?;
        let updated_at_ms = now_ms();

        {
            let mut statement = transaction
                .prepare_cached(
                    "INSERT INTO records(collection, record_id, fields_json, updated_at_ms)
                     VALUES(?1, ?2, ?3, ?4)
                     ON CONFLICT(collection, record_id)
                     DO UPDATE SET fields_json = excluded.fields_json, updated_at_ms = excluded.updated_at_ms",
                )
                .map_err(db_error("Could not prepare record import"))?;

            for (id, fields) in records {
                let fields_json = serde_json::to_string(fields)?;
                statement
                    .execute(params![collection, id, fields_json, updated_at_ms])
                    .map_err(db_error(format!("Could not store record '{collection}/{id}'")))?;
            }
        }

        transaction
            .commit()
            .map_err(db_error("Could not commit record import"))?;
        Ok(records.len())
    }

    pub fn get_record(&self, collection: &str, id: &str) -> CommandResult<Option<RawRecord>> {
        let connection = connect(&self.db_path)?;
        let raw = connection
            .query_row(
                "SELECT fields_json FROM records WHERE collection = ?1 AND record_id = ?2",
                params![collection, id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_error(format!("Could not read record '{collection}/{id}'")))?;

        raw.map(|raw| {
            Ok::<_, CoreError>(RawRecord {
                reference: RecordRef::new(collection, id),
                fields: parse_fields(&raw)?,
            })
        })
        .transpose()
    }

    /// Snapshot of a whole collection in insertion order.
    pub fn load_records(&self, collection: &str) -> CommandResult<Vec<RawRecord>> {
        let connection = connect(&self.db_path)?;
        let mut statement = connection
            .prepare(
                "SELECT record_id, fields_json FROM records WHERE collection = ?1 ORDER BY rowid ASC",
            )
            .map_err(db_error("Could not prepare collection scan"))?;

        let rows = statement
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_error(format!("Could not scan collection '{collection}'")))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, raw) = row.map_err(db_error("Could not parse record row"))?;
            records.push(RawRecord {
                reference: RecordRef::new(collection, id),
                fields: parse_fields(&raw)?,
            });
        }

        Ok(records)
    }
}

impl RecordSource for SqliteStore {
    fn records(&self, collection: &str) -> CommandResult<Vec<RawRecord>> {
        self.load_records(collection)
    }
}

impl MutationSink for SqliteStore {
    fn commit_batch(&self, batch: &MutationBatch) -> CommandResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut connection = connect(&self.db_path)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error(format!(
                "Could not start transaction for batch {}",
                batch.index()
            )))?;
        let updated_at_ms = now_ms();

        {
            let mut select = transaction
                .prepare_cached(
                    "SELECT fields_json FROM records WHERE collection = ?1 AND record_id = ?2",
                )
                .map_err(db_error("Could not prepare record lookup"))?;
            let mut update = transaction
                .prepare_cached(
                    "UPDATE records SET fields_json = ?1, updated_at_ms = ?2
                     WHERE collection = ?3 AND record_id = ?4",
                )
                .map_err(db_error("Could not prepare record update"))?;

            for entry in batch.entries() {
                let reference = &entry.reference;
                let raw = select
                    .query_row(params![reference.collection, reference.id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()
                    .map_err(db_error(format!(
                        "Could not read record '{}/{}'",
                        reference.collection, reference.id
                    )))?;
                let Some(raw) = raw else {
                    return Err(CoreError::StaleReference {
                        collection: reference.collection.clone(),
                        id: reference.id.clone(),
                    });
                };

                let mut fields = parse_fields(&raw)?;
                entry.update.apply_to(&mut fields);
                let fields_json = serde_json::to_string(&fields)?;
                update
                    .execute(params![
                        fields_json,
                        updated_at_ms,
                        reference.collection,
                        reference.id
                    ])
                    .map_err(db_error(format!(
                        "Could not update record '{}/{}'",
                        reference.collection, reference.id
                    )))?;
            }
        }

        transaction.commit().map_err(db_error(format!(
            "Could not commit batch {}",
            batch.index()
        )))
    }
}
