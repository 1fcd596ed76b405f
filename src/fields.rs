use serde_json::{Map, Value};

use crate::search::{derive_tokens, normalize_for_search};
use crate::types::FieldUpdate;

pub(crate) const NAME_FIELD: &str = "name";
pub(crate) const ALIASES_FIELD: &str = "aliases";
pub(crate) const NORMALIZED_NAME_FIELD: &str = "nameNormalized";
pub(crate) const NAME_TOKENS_FIELD: &str = "nameTokens";
pub(crate) const NORMALIZED_ALIASES_FIELD: &str = "aliasesNormalized";
pub(crate) const PREFERRED_LOCALE: &str = "en";

/// Picks the display name to normalize.
///
/// A localized name map prefers the `en` entry and otherwise falls back to the
/// first inserted entry. Anything that does not resolve to a string yields "".
pub(crate) fn resolve_display_name(fields: &Map<String, Value>) -> &str {
    match fields.get(NAME_FIELD) {
        Some(Value::String(name)) => name.as_str(),
        Some(Value::Object(localized)) => localized
            .get(PREFERRED_LOCALE)
            .and_then(Value::as_str)
            .or_else(|| localized.values().next().and_then(Value::as_str))
            .unwrap_or_default(),
        _ => "",
    }
}

/// Normalizes an arbitrary JSON value; non-strings become the empty text.
pub(crate) fn normalize_value(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(normalize_for_search)
        .unwrap_or_default()
}

fn normalized_aliases(aliases: &[Value]) -> Vec<Value> {
    aliases
        .iter()
        .filter_map(Value::as_str)
        .map(|alias| Value::String(normalize_for_search(alias)))
        .collect()
}

/// Builds the search-field delta for one record snapshot.
///
/// Canonical name and tokens are always rewritten. Aliases are rewritten when
/// the source has an alias list; without one, an empty normalized list is only
/// written if the record does not already carry one.
pub(crate) fn build_search_update(
    fields: &Map<String, Value>,
    token_lengths: &[usize],
) -> FieldUpdate {
    let canonical_name = normalize_for_search(resolve_display_name(fields));
    let tokens = derive_tokens(&canonical_name, token_lengths)
        .into_iter()
        .map(Value::String)
        .collect::<Vec<Value>>();

    let mut update = FieldUpdate::new()
        .set(NORMALIZED_NAME_FIELD, Value::String(canonical_name))
        .set(NAME_TOKENS_FIELD, Value::Array(tokens));

    match fields.get(ALIASES_FIELD) {
        Some(Value::Array(aliases)) => {
            let aliases = normalized_aliases(aliases);
            update = update.set(NORMALIZED_ALIASES_FIELD, Value::Array(aliases));
        }
        _ if !fields.contains_key(NORMALIZED_ALIASES_FIELD) => {
            update = update.set(NORMALIZED_ALIASES_FIELD, Value::Array(Vec::new()));
        }
        _ => {}
    }

    update
}

/// Maintenance delta that drops a single field.
pub(crate) fn removal_update(field: &str) -> FieldUpdate {
    FieldUpdate::new().delete(field)
}
