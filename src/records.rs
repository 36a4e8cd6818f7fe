use crate::database::{InsertOptions, Store};
use crate::dlog;
use crate::error::{Error, Result};
use crate::types::{Element, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Leading columns of every record table, when present.
pub const RECORD_COLUMN_ORDER: [&str; 4] = ["startDate", "endDate", "value", "unit"];

/// Rows per SQL transaction inside one record flush.
const RECORD_INSERT_CHUNK: usize = 50;

static TYPE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new("HK(?:Quantity|Category)TypeIdentifier").expect("static regex is valid")
});

/// Table for a record `type`, e.g. `HKQuantityTypeIdentifierHeartRate` -> `rHeartRate`.
pub fn table_for_type(record_type: &str) -> String {
    format!("r{}", TYPE_PREFIX.replace_all(record_type, ""))
}

/// Flatten an element's attributes plus its `MetadataEntry` children
/// (as `metadata_<key>`) into one row.
pub fn flatten_element(el: &Element) -> Result<Row> {
    let mut row = el.attrs_row();
    for entry in el.children_named("MetadataEntry") {
        let key = entry.attr("key").ok_or(Error::MissingField {
            element: "MetadataEntry",
            field: "key",
        })?;
        let value = entry.attr("value").ok_or(Error::MissingField {
            element: "MetadataEntry",
            field: "value",
        })?;
        row.insert(
            format!("metadata_{key}"),
            JsonValue::String(value.to_string()),
        );
    }
    Ok(row)
}

/// Group a batch of record rows by their `type` (which is removed) and write
/// one bulk insert per destination table.
///
/// The whole batch is checked before anything is written. Returns rows
/// written per table.
pub fn write_records<S: Store + ?Sized>(
    store: &mut S,
    records: Vec<Row>,
) -> Result<BTreeMap<String, usize>> {
    let mut by_table: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for mut record in records {
        let record_type = match record.remove("type") {
            Some(JsonValue::String(t)) => t,
            _ => {
                return Err(Error::MissingField {
                    element: "Record",
                    field: "type",
                });
            }
        };
        by_table
            .entry(table_for_type(&record_type))
            .or_default()
            .push(record);
    }

    let opts = InsertOptions {
        alter: true,
        column_order: &RECORD_COLUMN_ORDER,
        batch_size: RECORD_INSERT_CHUNK,
        ..InsertOptions::default()
    };
    let mut written = BTreeMap::new();
    for (table, rows) in by_table {
        dlog!("flush_records table={table} rows={}", rows.len());
        store.insert_all(&table, &rows, &opts)?;
        written.insert(table, rows.len());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use serde_json::json;

    fn record(t: Option<&str>, value: &str) -> Row {
        let mut r = Row::new();
        if let Some(t) = t {
            r.insert("type".into(), json!(t));
        }
        r.insert("value".into(), json!(value));
        r.insert("unit".into(), json!("count/min"));
        r
    }

    #[test]
    fn strips_known_prefixes() {
        assert_eq!(table_for_type("HKQuantityTypeIdentifierHeartRate"), "rHeartRate");
        assert_eq!(
            table_for_type("HKCategoryTypeIdentifierSleepAnalysis"),
            "rSleepAnalysis"
        );
        assert_eq!(
            table_for_type("HKDataTypeSleepDurationGoal"),
            "rHKDataTypeSleepDurationGoal"
        );
    }

    #[test]
    fn metadata_is_folded_into_fields() {
        let mut el = Element::new("Record");
        el.attrs.insert("type".into(), "HKQuantityTypeIdentifierStepCount".into());
        let mut meta = Element::new("MetadataEntry");
        meta.attrs.insert("key".into(), "HKTimeZone".into());
        meta.attrs.insert("value".into(), "Europe/Paris".into());
        el.children.push(meta);

        let row = flatten_element(&el).unwrap();
        assert_eq!(row["metadata_HKTimeZone"], json!("Europe/Paris"));
        assert_eq!(row["type"], json!("HKQuantityTypeIdentifierStepCount"));

        el.children.push(Element::new("MetadataEntry"));
        assert!(matches!(
            flatten_element(&el),
            Err(Error::MissingField { field: "key", .. })
        ));
    }

    #[test]
    fn routes_by_type_and_drops_the_type_column() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![
            record(Some("HKQuantityTypeIdentifierHeartRate"), "60"),
            record(Some("HKQuantityTypeIdentifierStepCount"), "12"),
            record(Some("HKQuantityTypeIdentifierHeartRate"), "61"),
        ];
        let written = write_records(&mut store, batch).unwrap();
        assert_eq!(written["rHeartRate"], 2);
        assert_eq!(written["rStepCount"], 1);

        let cols = store.table_columns("rHeartRate").unwrap();
        assert_eq!(cols, vec!["value", "unit"]);
        let n: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM rHeartRate", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
        assert!(!store.table_columns("rStepCount").unwrap().is_empty());
    }

    #[test]
    fn missing_type_is_fatal_and_writes_nothing() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![
            record(Some("HKQuantityTypeIdentifierHeartRate"), "60"),
            record(None, "1"),
        ];
        let err = write_records(&mut store, batch).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingField {
                element: "Record",
                field: "type"
            }
        ));
        assert!(store.table_columns("rHeartRate").unwrap().is_empty());
    }
}
