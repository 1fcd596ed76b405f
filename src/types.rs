use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable handle for a record inside a named collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub collection: String,
    pub id: String,
}

impl RecordRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// Snapshot of a stored record at enumeration time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub reference: RecordRef,
    pub fields: Map<String, Value>,
}

/// New value for one field, or an instruction to remove it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Set(Value),
    Delete,
}

/// Per-record delta: field name to new value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldUpdate {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), FieldValue::Set(value));
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldValue::Delete);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Applies the delta onto stored record fields.
    pub fn apply_to(&self, target: &mut Map<String, Value>) {
        for (field, value) in &self.fields {
            match value {
                FieldValue::Set(value) => {
                    target.insert(field.clone(), value.clone());
                }
                FieldValue::Delete => {
                    target.remove(field);
                }
            }
        }
    }
}

/// One entry of a batch: which record, and what to change on it.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMutation {
    pub reference: RecordRef,
    pub update: FieldUpdate,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_index: usize,
    pub entry_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one run over a collection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillStats {
    pub collection: String,
    pub scanned: usize,
    pub batches: usize,
    pub committed_batches: usize,
    pub failed_batches: Vec<BatchOutcome>,
    pub elapsed_ms: i64,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackfillProgress {
    pub collection: String,
    pub phase: String,
    pub scanned: usize,
    pub batches: usize,
    pub committed: usize,
    pub failed: usize,
    pub elapsed_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_sets_and_deletes_fields() {
        let mut fields = json!({ "name": "Yoga", "legacyTokens": ["yo"] })
            .as_object()
            .cloned()
            .unwrap_or_default();
        let update = FieldUpdate::new()
            .set("nameNormalized", json!("yoga"))
            .delete("legacyTokens")
            .delete("neverExisted");

        update.apply_to(&mut fields);

        assert_eq!(fields.get("nameNormalized"), Some(&json!("yoga")));
        assert_eq!(fields.get("name"), Some(&json!("Yoga")));
        assert!(!fields.contains_key("legacyTokens"));
        assert!(!fields.contains_key("neverExisted"));
    }

    #[test]
    fn delete_is_distinct_from_null() {
        let update = FieldUpdate::new().set("a", Value::Null).delete("b");
        assert_eq!(update.get("a"), Some(&FieldValue::Set(Value::Null)));
        assert_eq!(update.get("b"), Some(&FieldValue::Delete));

        let encoded = serde_json::to_value(&update).expect("update should serialize");
        assert_eq!(
            encoded,
            json!({ "a": { "op": "set", "value": null }, "b": { "op": "delete" } })
        );
    }
}
