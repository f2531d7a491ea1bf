// File: src/dataframe.rs
//
// The embedded SQL surface's runtime shape: `DataFrame`, the tabular value
// `OP_SQL_SELECT` produces, and `Database`, the collaborator trait the VM
// delegates `CREATE TABLE` / `INSERT` / `SELECT` bytecode to. The default
// collaborator is backed by an in-process `rusqlite` connection so the
// toolchain runs standalone with no external server.

use rusqlite::Connection;

use crate::value::Value;

/// A query or table-scan result: column names plus row-major values.
/// Distinct from `Value::Array` because a `DataFrame` is heterogeneous
/// across columns and carries its own name for `Display`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataFrame {
    pub fn empty(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self { name: name.into(), columns, rows: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct DbError(pub String);

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DbError {}

/// The collaborator the VM calls into for `OP_CREATE_TABLE`, `OP_INSERT`,
/// and `OP_SQL_SELECT`. The compiler assembles the literal SQL text for
/// each of these at compile time (table/column names are identifiers, not
/// expressions, so the whole statement is known statically) and stores it
/// as a string constant; the VM just hands that text to the collaborator.
/// Kept as a trait so an embedder can swap in a different backing store
/// without touching the dispatch loop.
pub trait Database {
    fn exec(&mut self, sql: &str) -> Result<(), DbError>;
    fn query(&mut self, sql: &str) -> Result<DataFrame, DbError>;
}

/// Default `Database` collaborator: a single-file-or-memory SQLite
/// connection. Scripts that never reach a SQL statement never pay for it
/// beyond opening the connection.
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(|e| DbError(e.to_string()))?;
        Ok(Self { conn })
    }

    fn sql_to_value(value: rusqlite::types::ValueRef<'_>) -> Value {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => Value::Nil,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(t) => Value::string(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::string(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl Database for SqliteDatabase {
    fn exec(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql).map_err(|e| DbError(e.to_string()))
    }

    fn query(&mut self, sql: &str) -> Result<DataFrame, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| DbError(e.to_string()))?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let width = column_names.len();
        let mut rows_out = Vec::new();
        let mut rows = stmt.query([]).map_err(|e| DbError(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| DbError(e.to_string()))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let v = row.get_ref(i).map_err(|e| DbError(e.to_string()))?;
                values.push(Self::sql_to_value(v));
            }
            rows_out.push(values);
        }
        Ok(DataFrame { name: "query".to_string(), columns: column_names, rows: rows_out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_insert_select_round_trip_through_raw_sql() {
        let mut db = SqliteDatabase::in_memory().unwrap();
        db.exec("CREATE TABLE people (name TEXT, age INTEGER)").unwrap();
        db.exec("INSERT INTO people (name, age) VALUES ('Ada', 30)").unwrap();
        let frame = db.query("SELECT name, age FROM people").unwrap();
        assert_eq!(frame.rows.len(), 1);
        assert_eq!(frame.rows[0][0], Value::string("Ada"));
        assert_eq!(frame.rows[0][1], Value::Integer(30));
    }

    #[test]
    fn select_with_explicit_column_subset() {
        let mut db = SqliteDatabase::in_memory().unwrap();
        db.exec("CREATE TABLE t (a INTEGER, b INTEGER)").unwrap();
        db.exec("INSERT INTO t (a, b) VALUES (1, 2)").unwrap();
        let frame = db.query("SELECT b FROM t").unwrap();
        assert_eq!(frame.columns, vec!["b".to_string()]);
        assert_eq!(frame.rows[0], vec![Value::Integer(2)]);
    }

    #[test]
    fn exec_error_is_reported_not_panicked() {
        let mut db = SqliteDatabase::in_memory().unwrap();
        assert!(db.exec("not sql at all").is_err());
    }
}
