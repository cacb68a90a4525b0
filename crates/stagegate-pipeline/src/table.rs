//! Table access used by snapshots to capture and restore database rows.
//!
//! Rows travel as JSON objects keyed by column name. No schema is recorded;
//! restoring assumes the table still exists with compatible columns.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde_json::{Number, Value};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// One table row, column name → value.
pub type Row = serde_json::Map<String, Value>;

/// Minimal table accessor needed for snapshot capture and restore.
pub trait TableStore: Send + Sync {
    /// Every row of `table`, in storage order.
    fn select_all(&self, table: &str) -> Result<Vec<Row>>;

    /// Remove every row of `table`.
    fn delete_all(&self, table: &str) -> Result<()>;

    /// Insert `rows` into `table`.
    fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<()>;

    /// Delete then insert. Implementations may make this atomic per table.
    fn replace_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        self.delete_all(table)?;
        self.insert_rows(table, rows)
    }
}

/// [`TableStore`] over a SQLite connection.
pub struct SqliteTableStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTableStore").finish_non_exhaustive()
    }
}

impl SqliteTableStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Run one or more SQL statements (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl TableStore for SqliteTableStore {
    fn select_all(&self, table: &str) -> Result<Vec<Row>> {
        let table = quote_identifier(table)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map([], |row| {
                let mut map = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    map.insert(name.clone(), sql_to_json(row.get_ref(i)?));
                }
                Ok(map)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(%table, rows = rows.len(), "Selected table rows");
        Ok(rows)
    }

    fn delete_all(&self, table: &str) -> Result<()> {
        let table = quote_identifier(table)?;
        self.conn.lock().execute(&format!("DELETE FROM {table}"), [])?;
        Ok(())
    }

    fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        let table = quote_identifier(table)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_in(&tx, &table, rows)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        let table = quote_identifier(table)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {table}"), [])?;
        insert_in(&tx, &table, rows)?;
        tx.commit()?;
        debug!(%table, rows = rows.len(), "Replaced table rows");
        Ok(())
    }
}

fn insert_in(conn: &Connection, table: &str, rows: &[Row]) -> Result<()> {
    for row in rows {
        if row.is_empty() {
            conn.execute(&format!("INSERT INTO {table} DEFAULT VALUES"), [])?;
            continue;
        }
        let columns = row
            .keys()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<SqlValue> = row.values().map(json_to_sql).collect();
        conn.execute(&sql, params_from_iter(values.iter()))?;
    }
    Ok(())
}

/// Validate a table or column name and wrap it in double quotes.
fn quote_identifier(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(PipelineError::Database(format!("invalid identifier: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(items) => match as_bytes(items) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn as_bytes(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteTableStore {
        let store = SqliteTableStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, data BLOB);
                 INSERT INTO items VALUES (1, 'apple', 1.5, x'0102');
                 INSERT INTO items VALUES (2, 'pear', NULL, NULL);",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_select_all_maps_types() {
        let rows = store().select_all("items").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("apple"));
        assert_eq!(rows[0]["price"], json!(1.5));
        assert_eq!(rows[0]["data"], json!([1, 2]));
        assert_eq!(rows[1]["price"], Value::Null);
    }

    #[test]
    fn test_replace_rows_roundtrip() {
        let store = store();
        let before = store.select_all("items").unwrap();

        store.execute_batch("UPDATE items SET name = 'changed'; INSERT INTO items VALUES (3, 'plum', 2.0, NULL);").unwrap();
        store.replace_rows("items", &before).unwrap();

        assert_eq!(store.select_all("items").unwrap(), before);
    }

    #[test]
    fn test_delete_then_insert() {
        let store = store();
        let rows = store.select_all("items").unwrap();
        store.delete_all("items").unwrap();
        assert!(store.select_all("items").unwrap().is_empty());
        store.insert_rows("items", &rows).unwrap();
        assert_eq!(store.select_all("items").unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let store = store();
        let err = store.select_all("items; DROP TABLE items").unwrap_err();
        assert!(matches!(err, PipelineError::Database(_)));
        assert!(store.select_all("").is_err());
        assert!(store.select_all("1items").is_err());
    }

    #[test]
    fn test_missing_table_is_error() {
        assert!(store().select_all("nope").is_err());
    }
}
