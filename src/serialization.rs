//! Metadata serialization: export/import between SQLite and JSON.
//!
//! Mirrors the schema in [`crate::directory::sqlite`] table for table, so
//! `hatrac-admin export` followed by `hatrac-admin import` against an
//! empty database reproduces the directory exactly (modulo redacted
//! credential secrets).

use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const VERSION: &str = "0.1.0";
pub const EXPORT_VERSION: i64 = 1;

pub const ALL_TABLES: &[&str] = &["name", "version", "upload", "chunk", "credential"];

const JSON_FIELDS: &[&str] = &["acl", "metadata"];
const BOOL_FIELDS: &[&str] = &["is_deleted", "active"];

const TABLE_COLUMNS: &[(&str, &[&str])] = &[
    (
        "name",
        &[
            "id",
            "parent_id",
            "path",
            "subtype",
            "is_deleted",
            "acl",
            "metadata",
            "created_at",
        ],
    ),
    (
        "version",
        &[
            "id",
            "object_id",
            "version_tag",
            "nbytes",
            "metadata",
            "is_deleted",
            "acl",
            "created_at",
        ],
    ),
    (
        "upload",
        &[
            "id",
            "object_id",
            "job_token",
            "nbytes",
            "chunksize",
            "metadata",
            "acl",
            "created_at",
        ],
    ),
    ("chunk", &["upload_id", "position", "aux"]),
    (
        "credential",
        &["client_id", "secret_key", "display_name", "active", "created_at"],
    ),
];

const TABLE_ORDER_BY: &[(&str, &str)] = &[
    ("name", "id"),
    ("version", "id"),
    ("upload", "id"),
    ("chunk", "upload_id, position"),
    ("credential", "client_id"),
];

// Children before parents, so a `replace` import can wipe and reload
// without tripping over a row referencing one not yet inserted.
const DELETE_ORDER: &[&str] = &["chunk", "upload", "version", "name", "credential"];
const INSERT_ORDER: &[&str] = &["name", "version", "upload", "chunk", "credential"];

pub struct ExportOptions {
    pub tables: Vec<String>,
    pub include_credentials: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            tables: ALL_TABLES.iter().map(|s| s.to_string()).collect(),
            include_credentials: false,
        }
    }
}

pub struct ImportOptions {
    pub replace: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { replace: false }
    }
}

pub struct ImportResult {
    pub counts: BTreeMap<String, usize>,
    pub skipped: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

fn is_json_field(col: &str) -> bool {
    JSON_FIELDS.contains(&col)
}

fn is_bool_field(col: &str) -> bool {
    BOOL_FIELDS.contains(&col)
}

fn get_columns(table: &str) -> Option<&'static [&'static str]> {
    TABLE_COLUMNS
        .iter()
        .find(|(t, _)| *t == table)
        .map(|(_, cols)| *cols)
}

fn get_order_by(table: &str) -> &'static str {
    TABLE_ORDER_BY
        .iter()
        .find(|(t, _)| *t == table)
        .map(|(_, o)| *o)
        .unwrap_or("rowid")
}

fn get_schema_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .unwrap_or(1)
}

/// Read a column value from a rusqlite Row and convert to serde_json Value.
fn read_column(row: &rusqlite::Row, idx: usize, col: &str) -> Value {
    if is_json_field(col) {
        let s: Option<String> = row.get(idx).ok();
        match s {
            None => Value::Null,
            Some(s) => serde_json::from_str(&s).unwrap_or(Value::Object(Map::new())),
        }
    } else if is_bool_field(col) {
        let v: Option<i64> = row.get(idx).ok();
        match v {
            None => Value::Null,
            Some(v) => Value::Bool(v != 0),
        }
    } else if let Ok(v) = row.get::<_, i64>(idx) {
        Value::Number(v.into())
    } else if let Ok(v) = row.get::<_, f64>(idx) {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Ok(v) = row.get::<_, String>(idx) {
        Value::String(v)
    } else {
        Value::Null
    }
}

pub fn export_metadata(db_path: &str, opts: &ExportOptions) -> anyhow::Result<String> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let schema_version = get_schema_version(&conn);
    let now = chrono_now();

    let mut result = BTreeMap::<String, Value>::new();
    result.insert(
        "hatrac_export".to_string(),
        json!({
            "exported_at": now,
            "schema_version": schema_version,
            "source": format!("rust/{}", VERSION),
            "version": EXPORT_VERSION,
        }),
    );

    for table in &opts.tables {
        let columns = match get_columns(table) {
            Some(c) => c,
            None => continue,
        };
        let order_by = get_order_by(table);
        let query = format!("SELECT * FROM {} ORDER BY {}", table, order_by);
        let mut stmt = conn.prepare(&query)?;

        let mut rows_out: Vec<Value> = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut obj = Map::new();
            for (i, col) in columns.iter().enumerate() {
                obj.insert(col.to_string(), read_column(row, i, col));
            }
            if table == "credential" && !opts.include_credentials {
                obj.insert("secret_key".to_string(), Value::String("REDACTED".to_string()));
            }
            rows_out.push(Value::Object(obj));
        }
        result.insert(table.to_string(), Value::Array(rows_out));
    }

    // BTreeMap serializes with sorted keys. Use 2-space indent.
    let json = serde_json::to_string_pretty(&result)?;
    Ok(json)
}

pub fn import_metadata(
    db_path: &str,
    json_str: &str,
    opts: &ImportOptions,
) -> anyhow::Result<ImportResult> {
    let data: BTreeMap<String, Value> = serde_json::from_str(json_str)?;

    let envelope = data
        .get("hatrac_export")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow::anyhow!("missing hatrac_export envelope"))?;
    let version = envelope
        .get("version")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if version < 1 || version > EXPORT_VERSION {
        anyhow::bail!("unsupported export version: {}", version);
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    let mut result = ImportResult {
        counts: BTreeMap::new(),
        skipped: BTreeMap::new(),
        warnings: Vec::new(),
    };

    let tx = conn.unchecked_transaction()?;

    if opts.replace {
        for table in DELETE_ORDER {
            if data.contains_key(*table) {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
        }
    }

    for table in INSERT_ORDER {
        let rows_data = match data.get(*table) {
            Some(Value::Array(arr)) => arr,
            _ => continue,
        };
        let columns = match get_columns(table) {
            Some(c) => c,
            None => continue,
        };

        let mut inserted = 0usize;
        let mut skipped = 0usize;

        for row_val in rows_data {
            let row = match row_val.as_object() {
                Some(m) => m,
                None => {
                    skipped += 1;
                    continue;
                }
            };

            if *table == "credential" {
                if let Some(Value::String(sk)) = row.get("secret_key") {
                    if sk == "REDACTED" {
                        skipped += 1;
                        let client_id = row
                            .get("client_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("?");
                        result.warnings.push(format!(
                            "Skipped credential '{}': REDACTED secret_key",
                            client_id
                        ));
                        continue;
                    }
                }
            }

            let col_names = columns.join(", ");
            let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
            let ph = placeholders.join(", ");

            let sql = if opts.replace {
                format!("INSERT INTO {} ({}) VALUES ({})", table, col_names, ph)
            } else {
                format!(
                    "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                    table, col_names, ph
                )
            };

            let values: Vec<Box<dyn rusqlite::types::ToSql>> = columns
                .iter()
                .map(|col| collapse_value(row.get(*col).cloned().unwrap_or(Value::Null), col))
                .collect();

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();

            match tx.execute(&sql, param_refs.as_slice()) {
                Ok(n) if n > 0 => inserted += 1,
                Ok(_) => skipped += 1,
                Err(e) => {
                    skipped += 1;
                    result
                        .warnings
                        .push(format!("Skipped {} row: {}", table, e));
                }
            }
        }

        result.counts.insert(table.to_string(), inserted);
        result.skipped.insert(table.to_string(), skipped);
    }

    tx.commit()?;
    Ok(result)
}

fn collapse_value(val: Value, col: &str) -> Box<dyn rusqlite::types::ToSql> {
    if is_json_field(col) {
        match val {
            Value::Null => Box::new(Option::<String>::None),
            _ => Box::new(serde_json::to_string(&val).unwrap_or_else(|_| "{}".to_string())),
        }
    } else if is_bool_field(col) {
        match val {
            Value::Null => Box::new(Option::<i64>::None),
            Value::Bool(b) => Box::new(if b { 1i64 } else { 0i64 }),
            _ => Box::new(0i64),
        }
    } else {
        match val {
            Value::Null => Box::new(Option::<String>::None),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Box::new(i)
                } else if let Some(f) = n.as_f64() {
                    Box::new(f)
                } else {
                    Box::new(n.to_string())
                }
            }
            Value::String(s) => Box::new(s),
            _ => Box::new(serde_json::to_string(&val).unwrap_or_default()),
        }
    }
}

fn chrono_now() -> String {
    // Simple UTC timestamp without pulling in chrono's formatting surface
    // for this one call site.
    use std::time::SystemTime;
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap();
    let secs = dur.as_secs();
    let days = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let (year, month, day) = days_to_date(days as i64);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.000Z",
        year, month, day, hours, minutes, seconds
    )
}

fn days_to_date(days: i64) -> (i64, i64, i64) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{params, Connection};

    const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);
INSERT OR IGNORE INTO schema_version (version) VALUES (1);

CREATE TABLE IF NOT EXISTS name (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER,
    path TEXT NOT NULL,
    subtype INTEGER NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    acl TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS version (
    id INTEGER PRIMARY KEY,
    object_id INTEGER NOT NULL,
    version_tag TEXT,
    nbytes INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    acl TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS upload (
    id INTEGER PRIMARY KEY,
    object_id INTEGER NOT NULL,
    job_token TEXT NOT NULL,
    nbytes INTEGER NOT NULL,
    chunksize INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    acl TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chunk (
    upload_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    aux TEXT NOT NULL,
    PRIMARY KEY (upload_id, position)
);
CREATE TABLE IF NOT EXISTS credential (
    client_id TEXT PRIMARY KEY,
    secret_key TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
"#;

    fn create_test_db(path: &str, seed: bool) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        if seed {
            conn.execute(
                "INSERT INTO name (id, parent_id, path, subtype, is_deleted, acl, metadata, created_at) VALUES (1, NULL, '/', 0, 0, '{}', '{}', ?1)",
                params!["2026-02-25T12:00:00.000Z"],
            ).unwrap();
            conn.execute(
                "INSERT INTO name (id, parent_id, path, subtype, is_deleted, acl, metadata, created_at) VALUES (2, 1, '/obj', 1, 0, ?1, '{}', ?2)",
                params![r#"{"owner":["alice"]}"#, "2026-02-25T12:05:00.000Z"],
            ).unwrap();
            conn.execute(
                "INSERT INTO version (id, object_id, version_tag, nbytes, metadata, is_deleted, acl, created_at) VALUES (1, 2, ?1, 5, ?2, 0, '{}', ?3)",
                params!["abc123", r#"{"content-type":"text/plain"}"#, "2026-02-25T12:05:01.000Z"],
            ).unwrap();
            conn.execute(
                "INSERT INTO credential (client_id, secret_key, display_name, active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
                params!["alice", "s3cr3t", "Alice", "2026-02-25T12:00:00.000Z"],
            ).unwrap();
        }
    }

    #[test]
    fn export_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        create_test_db(db_str, true);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();

        let envelope = data["hatrac_export"].as_object().unwrap();
        assert_eq!(envelope["version"], 1);
        assert_eq!(envelope["source"], "rust/0.1.0");

        assert_eq!(data["name"].as_array().unwrap().len(), 2);
        assert_eq!(data["version"].as_array().unwrap().len(), 1);
        assert_eq!(data["credential"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn export_acl_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        create_test_db(db_str, true);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();

        let object = &data["name"][1];
        let acl = object["acl"].as_object().unwrap();
        assert_eq!(acl["owner"][0], "alice");
    }

    #[test]
    fn export_bool_fields() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        create_test_db(db_str, true);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();

        assert_eq!(data["name"][0]["is_deleted"], false);
        assert_eq!(data["credential"][0]["active"], true);
    }

    #[test]
    fn export_credentials_redacted_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        create_test_db(db_str, true);

        let result = export_metadata(db_str, &ExportOptions::default()).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();
        assert_eq!(data["credential"][0]["secret_key"], "REDACTED");
    }

    #[test]
    fn export_credentials_included_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let db_str = db.to_str().unwrap();
        create_test_db(db_str, true);

        let opts = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let result = export_metadata(db_str, &opts).unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&result).unwrap();
        assert_eq!(data["credential"][0]["secret_key"], "s3cr3t");
    }

    #[test]
    fn round_trip_reproduces_export() {
        let dir = tempfile::tempdir().unwrap();
        let db1 = dir.path().join("source.db");
        let db2 = dir.path().join("target.db");
        create_test_db(db1.to_str().unwrap(), true);
        create_test_db(db2.to_str().unwrap(), false);

        let opts = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let exported = export_metadata(db1.to_str().unwrap(), &opts).unwrap();
        let result = import_metadata(db2.to_str().unwrap(), &exported, &ImportOptions::default()).unwrap();

        assert_eq!(*result.counts.get("name").unwrap(), 2);
        assert_eq!(*result.counts.get("version").unwrap(), 1);

        let re_exported = export_metadata(db2.to_str().unwrap(), &opts).unwrap();
        let mut data1: BTreeMap<String, Value> = serde_json::from_str(&exported).unwrap();
        let mut data2: BTreeMap<String, Value> = serde_json::from_str(&re_exported).unwrap();
        data1.remove("hatrac_export");
        data2.remove("hatrac_export");
        assert_eq!(data1, data2);
    }

    #[test]
    fn import_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        create_test_db(db.to_str().unwrap(), true);

        let opts = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let exported = export_metadata(db.to_str().unwrap(), &opts).unwrap();
        let result = import_metadata(db.to_str().unwrap(), &exported, &ImportOptions::default()).unwrap();

        assert_eq!(*result.counts.get("name").unwrap(), 0);
    }

    #[test]
    fn import_skips_redacted_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let db1 = dir.path().join("source.db");
        let db2 = dir.path().join("target.db");
        create_test_db(db1.to_str().unwrap(), true);
        create_test_db(db2.to_str().unwrap(), false);

        let exported = export_metadata(db1.to_str().unwrap(), &ExportOptions::default()).unwrap();
        let result = import_metadata(db2.to_str().unwrap(), &exported, &ImportOptions::default()).unwrap();

        assert_eq!(*result.skipped.get("credential").unwrap(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("REDACTED"));
    }

    #[test]
    fn import_rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        create_test_db(db.to_str().unwrap(), false);

        let err = import_metadata(
            db.to_str().unwrap(),
            r#"{"hatrac_export":{"version":99}}"#,
            &ImportOptions::default(),
        );
        assert!(err.is_err());
    }
}
