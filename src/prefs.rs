//! Persisted table display preferences.
//!
//! Preferences are stored as JSON blobs in the settings table and may have
//! been written by any earlier build, so everything read back is treated
//! as untrusted: unknown columns are dropped, bad widths discarded, and
//! the legacy bare-list shape is migrated through a fixed alias table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::columns::ColumnSpec;
use crate::db::{Database, DbError, DbResult};

/// Display state for one table, keyed by column key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePreferences {
    #[serde(default)]
    pub visible_columns: Vec<String>,
    #[serde(default)]
    pub column_widths: BTreeMap<String, u32>,
    #[serde(default)]
    pub sort_column: Option<String>,
    #[serde(default)]
    pub sort_descending: bool,
}

/// Old column names from builds that stored a bare list of names.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("status", "current_status"),
    ("number", "app_number"),
    ("patent_num", "patent_number"),
    ("pub_number", "publication_number"),
    ("pub_date", "publication_date"),
    ("expiration", "expiration_date"),
    ("docket", "docket_number"),
];

fn resolve_alias(name: &str) -> &str {
    LEGACY_ALIASES
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, new)| *new)
        .unwrap_or(name)
}

fn known_column(columns: &[ColumnSpec], key: &str) -> bool {
    columns.iter().any(|c| c.key == key)
}

/// Sanitize a raw preference blob against the current column schema.
///
/// Never fails: anything unrecognizable degrades to the schema defaults.
pub fn validate(raw: &Value, columns: &[ColumnSpec]) -> TablePreferences {
    // Legacy shape: a bare list of column names.
    let mut prefs = if let Some(list) = raw.as_array() {
        TablePreferences {
            visible_columns: list
                .iter()
                .filter_map(Value::as_str)
                .map(|name| resolve_alias(name).to_string())
                .collect(),
            ..TablePreferences::default()
        }
    } else if let Some(obj) = raw.as_object() {
        // Each field degrades on its own: one bad width entry must not
        // wipe the user's column customization.
        TablePreferences {
            visible_columns: obj
                .get("visible_columns")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            column_widths: obj
                .get("column_widths")
                .and_then(Value::as_object)
                .map(|widths| {
                    widths
                        .iter()
                        .filter_map(|(key, width)| {
                            width
                                .as_u64()
                                .and_then(|w| u32::try_from(w).ok())
                                .map(|w| (key.clone(), w))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            sort_column: obj
                .get("sort_column")
                .and_then(Value::as_str)
                .map(String::from),
            sort_descending: obj
                .get("sort_descending")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    } else {
        TablePreferences::default()
    };

    // Unknown columns out, duplicates out, order preserved.
    let mut seen: Vec<String> = Vec::new();
    for key in prefs.visible_columns {
        if known_column(columns, &key) && !seen.contains(&key) {
            seen.push(key);
        }
    }
    prefs.visible_columns = seen;

    if prefs.visible_columns.is_empty() {
        prefs.visible_columns = columns
            .iter()
            .filter(|c| c.default_visible)
            .map(|c| c.key.to_string())
            .collect();
    } else {
        // Surface newly introduced default-visible columns without
        // resetting the user's ordering.
        for col in columns.iter().filter(|c| c.default_visible) {
            if !prefs.visible_columns.iter().any(|k| k == col.key) {
                prefs.visible_columns.push(col.key.to_string());
            }
        }
    }

    prefs
        .column_widths
        .retain(|key, width| known_column(columns, key) && *width > 0);

    if let Some(sort) = &prefs.sort_column {
        if !known_column(columns, sort) {
            prefs.sort_column = None;
        }
    }

    prefs
}

fn prefs_key(table_id: &str) -> String {
    format!("table_prefs:{table_id}")
}

/// Load and sanitize the preferences for one table. A missing or corrupt
/// blob yields the schema defaults; store failures propagate.
pub fn load(db: &Database, table_id: &str, columns: &[ColumnSpec]) -> DbResult<TablePreferences> {
    let raw = match db.get_raw_json_setting(&prefs_key(table_id)) {
        Ok(Some(value)) => value,
        Ok(None) | Err(DbError::SettingJson { .. }) => Value::Null,
        Err(e) => return Err(e),
    };
    Ok(validate(&raw, columns))
}

/// Persist the preferences for one table.
pub fn save(db: &Database, table_id: &str, prefs: &TablePreferences) -> DbResult<()> {
    db.set_json_setting(&prefs_key(table_id), prefs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::PATENT_COLUMNS;
    use serde_json::json;

    fn default_keys() -> Vec<String> {
        PATENT_COLUMNS
            .iter()
            .filter(|c| c.default_visible)
            .map(|c| c.key.to_string())
            .collect()
    }

    #[test]
    fn unknown_columns_are_dropped() {
        let raw = json!({
            "visible_columns": ["app_number", "bogus_column", "title"],
            "column_widths": {},
        });
        let prefs = validate(&raw, PATENT_COLUMNS);
        assert!(prefs.visible_columns.contains(&"app_number".to_string()));
        assert!(prefs.visible_columns.contains(&"title".to_string()));
        assert!(!prefs.visible_columns.iter().any(|k| k == "bogus_column"));
    }

    #[test]
    fn empty_or_corrupt_blobs_fall_back_to_defaults() {
        for raw in [json!(null), json!(17), json!("oops"), json!({ "visible_columns": [] })] {
            let prefs = validate(&raw, PATENT_COLUMNS);
            assert_eq!(prefs.visible_columns, default_keys());
            assert!(prefs.column_widths.is_empty());
            assert_eq!(prefs.sort_column, None);
        }
    }

    #[test]
    fn new_default_visible_columns_are_appended_in_schema_order() {
        // A customization that predates some of today's default columns.
        let raw = json!({ "visible_columns": ["title", "app_number"] });
        let prefs = validate(&raw, PATENT_COLUMNS);

        // Customized ordering kept.
        assert_eq!(prefs.visible_columns[0], "title");
        assert_eq!(prefs.visible_columns[1], "app_number");

        // Every default-visible column present, the appended ones in
        // schema order.
        for key in default_keys() {
            assert!(prefs.visible_columns.contains(&key), "missing {key}");
        }
        let appended: Vec<_> = prefs.visible_columns[2..].to_vec();
        let expected: Vec<_> = default_keys()
            .into_iter()
            .filter(|k| k != "title" && k != "app_number")
            .collect();
        assert_eq!(appended, expected);
    }

    #[test]
    fn bad_widths_and_sort_are_dropped() {
        let raw = json!({
            "visible_columns": ["app_number", "title"],
            "column_widths": {
                "app_number": 120,
                "bogus_column": 90,
                "title": 0
            },
            "sort_column": "bogus_column",
            "sort_descending": true
        });
        let prefs = validate(&raw, PATENT_COLUMNS);
        assert_eq!(prefs.column_widths.get("app_number"), Some(&120));
        assert!(!prefs.column_widths.contains_key("bogus_column"));
        assert!(!prefs.column_widths.contains_key("title"));
        assert_eq!(prefs.sort_column, None);
        assert!(prefs.sort_descending);
    }

    #[test]
    fn one_bad_width_does_not_wipe_the_rest() {
        let raw = json!({
            "visible_columns": ["title"],
            "column_widths": { "title": "wide" },
            "sort_column": "title"
        });
        let prefs = validate(&raw, PATENT_COLUMNS);
        // The customization survives; only the offending entry is gone.
        assert_eq!(prefs.visible_columns[0], "title");
        assert!(prefs.column_widths.is_empty());
        assert_eq!(prefs.sort_column.as_deref(), Some("title"));
    }

    #[test]
    fn width_entries_are_dropped_independently() {
        let raw = json!({
            "visible_columns": ["app_number", "title"],
            "column_widths": {
                "app_number": 120,
                "title": -5,
                "examiner": 1.5,
                "filing_date": 95
            },
            "sort_column": "filing_date"
        });
        let prefs = validate(&raw, PATENT_COLUMNS);
        assert_eq!(prefs.column_widths.get("app_number"), Some(&120));
        assert_eq!(prefs.column_widths.get("filing_date"), Some(&95));
        assert!(!prefs.column_widths.contains_key("title"));
        assert!(!prefs.column_widths.contains_key("examiner"));
        assert_eq!(prefs.visible_columns[0], "app_number");
        assert_eq!(prefs.sort_column.as_deref(), Some("filing_date"));
    }

    #[test]
    fn legacy_list_is_migrated_through_aliases() {
        let raw = json!(["status", "app_number", "docket"]);
        let prefs = validate(&raw, PATENT_COLUMNS);
        assert!(prefs.visible_columns.contains(&"current_status".to_string()));
        assert!(prefs.visible_columns.contains(&"docket_number".to_string()));
        assert!(!prefs.visible_columns.iter().any(|k| k == "status"));
        assert_eq!(prefs.sort_column, None);
        assert!(prefs.column_widths.is_empty());
    }

    #[test]
    fn load_degrades_on_corrupt_blob_but_propagates_store_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(dir.path().join("patents.db"));
        db.initialize().unwrap();

        // A corrupt blob is sanitized down to the defaults.
        db.set_setting("table_prefs:patents", "{not json").unwrap();
        let prefs = load(&db, "patents", PATENT_COLUMNS).unwrap();
        assert_eq!(prefs.visible_columns, default_keys());

        // An unopenable store is an error, not silently empty prefs.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let broken = Database::new(blocker.join("patents.db"));
        assert!(load(&broken, "patents", PATENT_COLUMNS).is_err());
    }

    #[test]
    fn duplicates_are_collapsed() {
        let raw = json!({ "visible_columns": ["title", "title", "app_number"] });
        let prefs = validate(&raw, PATENT_COLUMNS);
        let titles = prefs.visible_columns.iter().filter(|k| *k == "title").count();
        assert_eq!(titles, 1);
    }

    #[test]
    fn load_save_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(dir.path().join("patents.db"));
        db.initialize().unwrap();

        // First run: defaults.
        let initial = load(&db, "patents", PATENT_COLUMNS).unwrap();
        assert_eq!(initial.visible_columns, default_keys());

        let mut prefs = initial;
        prefs.visible_columns.retain(|k| k != "examiner");
        prefs.sort_column = Some("filing_date".into());
        prefs.column_widths.insert("title".into(), 320);
        save(&db, "patents", &prefs).unwrap();

        let reloaded = load(&db, "patents", PATENT_COLUMNS).unwrap();
        assert_eq!(reloaded.sort_column.as_deref(), Some("filing_date"));
        assert_eq!(reloaded.column_widths.get("title"), Some(&320));
        // examiner is default-visible, so it is re-appended on load.
        assert!(reloaded.visible_columns.contains(&"examiner".to_string()));
    }
}
