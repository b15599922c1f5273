use parking_lot::Mutex;
use rusqlite::{params, types::ValueRef, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::DEFAULT_TABLE;
use crate::error::{StoreError, StoreResult};
use crate::protocol::SearchScope;

/// A single key/value pair as returned by `list` and the `search*` family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: String,
}

/// Connection and active table pointer move together under one lock, so a
/// `use` can never be observed half-applied.
struct Inner {
    conn: Connection,
    active: String,
}

/// Table-scoped key/value operations over the in-memory SQLite working copy.
///
/// Every table has the schema `(key TEXT PRIMARY KEY, value TEXT)`. All
/// record operations target the process-wide active table, which is switched
/// with [`RecordStore::use_table`] and always names an existing table.
///
/// ## Identifier safety
/// Table names never reach SQL unchecked: they are reduced to
/// `[A-Za-z0-9_]` by [`sanitize_table_name`] and then double-quoted. Keys,
/// values and patterns are always bound as parameters.
///
/// ## Blocking
/// Methods are synchronous and hold the connection lock for the duration of
/// the statement. Callers on the async runtime go through
/// `spawn_blocking` (see `Engine`).
pub struct RecordStore {
    inner: Mutex<Inner>,
}

impl RecordStore {
    /// Opens an empty in-memory working copy with the default table active.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_table(&conn, DEFAULT_TABLE)?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, active: DEFAULT_TABLE.to_string() }),
        })
    }

    pub fn active_table(&self) -> String {
        self.inner.lock().active.clone()
    }

    /// Switches the active table, creating it if absent. Idempotent.
    pub fn use_table(&self, raw: &str) -> StoreResult<String> {
        let name = sanitize_table_name(raw)?;
        let mut inner = self.inner.lock();
        create_table(&inner.conn, &name)?;
        inner.active = name.clone();
        Ok(name)
    }

    /// Drops a table. When the active table is dropped the pointer falls back
    /// to the default table, which is recreated if needed.
    pub fn drop_table(&self, raw: &str) -> StoreResult<String> {
        let name = sanitize_table_name(raw)?;
        let mut inner = self.inner.lock();
        if !table_exists(&inner.conn, &name)? {
            return Err(StoreError::TableNotFound(name));
        }
        inner.conn.execute_batch(&format!("DROP TABLE {}", quote_ident(&name)))?;
        if inner.active == name {
            create_table(&inner.conn, DEFAULT_TABLE)?;
            inner.active = DEFAULT_TABLE.to_string();
        }
        Ok(name)
    }

    pub fn tables(&self) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT name FROM main.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Upserts one record; last write wins.
    pub fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let inner = self.inner.lock();
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            quote_ident(&inner.active)
        );
        inner.conn.execute(&sql, params![key, value])?;
        Ok(())
    }

    /// Fetches a value. A missing key is `KeyNotFound`; a stored empty (or
    /// NULL) value is returned as an empty string.
    pub fn get(&self, key: &str) -> StoreResult<String> {
        let inner = self.inner.lock();
        let sql = format!("SELECT value FROM {} WHERE key = ?1", quote_ident(&inner.active));
        let value = inner
            .conn
            .query_row(&sql, params![key], |row| text_at(row, 0))
            .optional()?;
        value.ok_or(StoreError::KeyNotFound)
    }

    /// Removes one record. The existence check runs strictly before the
    /// delete, under the same lock.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let inner = self.inner.lock();
        let table = quote_ident(&inner.active);
        let exists = inner
            .conn
            .query_row(&format!("SELECT 1 FROM {} WHERE key = ?1", table), params![key], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::KeyNotFound);
        }
        inner.conn.execute(&format!("DELETE FROM {} WHERE key = ?1", table), params![key])?;
        Ok(())
    }

    /// Deletes every record of the active table; the table itself stays.
    pub fn clear(&self) -> StoreResult<usize> {
        let inner = self.inner.lock();
        let n = inner.conn.execute(&format!("DELETE FROM {}", quote_ident(&inner.active)), [])?;
        Ok(n)
    }

    /// Substring search with the pattern wildcarded on both sides.
    pub fn search(&self, scope: SearchScope, pattern: &str) -> StoreResult<Vec<Record>> {
        let inner = self.inner.lock();
        let predicate = match scope {
            SearchScope::KeyOrValue => "key LIKE ?1 OR value LIKE ?1",
            SearchScope::Key => "key LIKE ?1",
            SearchScope::Value => "value LIKE ?1",
        };
        let sql = format!(
            "SELECT key, value FROM {} WHERE {} ORDER BY key",
            quote_ident(&inner.active),
            predicate
        );
        let mut stmt = inner.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![format!("%{}%", pattern)], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Materializes the whole active table, ordered by key.
    pub fn list(&self) -> StoreResult<Vec<Record>> {
        let inner = self.inner.lock();
        let sql = format!("SELECT key, value FROM {} ORDER BY key", quote_ident(&inner.active));
        let mut stmt = inner.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Replaces the full content of the active table in one transaction.
    pub fn replace_all(&self, entries: &[(String, String)]) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let table = quote_ident(&inner.active);
        let tx = inner.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", table), [])?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {} (key, value) VALUES (?1, ?2)", table))?;
            for (k, v) in entries {
                stmt.execute(params![k, v])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Upserts many records into the active table in one transaction.
    pub fn upsert_all(&self, entries: &[(String, String)]) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let table = quote_ident(&inner.active);
        let tx = inner.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare(&format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", table))?;
            for (k, v) in entries {
                stmt.execute(params![k, v])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Executes a caller-supplied statement verbatim and returns its rows.
    ///
    /// This is the privileged passthrough: no validation, no table scoping.
    /// The statement can read, rewrite or drop anything in the working copy.
    /// If it removes the active table, the pointer falls back to the default
    /// table exactly as [`RecordStore::drop_table`] does.
    pub fn query_raw(&self, sql: &str) -> StoreResult<Vec<Map<String, Value>>> {
        let mut inner = self.inner.lock();
        let out = run_raw(&inner.conn, sql);
        if !table_exists(&inner.conn, &inner.active)? {
            warn!(table = %inner.active, "active table removed by raw statement");
            create_table(&inner.conn, DEFAULT_TABLE)?;
            inner.active = DEFAULT_TABLE.to_string();
        }
        out
    }

    /// Writes a consistent image of the whole working copy to `path`.
    ///
    /// `VACUUM INTO` refuses to overwrite a non-empty file, so the caller is
    /// expected to hand in a fresh path.
    pub fn export_to(&self, path: &Path) -> StoreResult<()> {
        let inner = self.inner.lock();
        inner.conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().into_owned()])?;
        Ok(())
    }

    /// Merges every table of a snapshot file into the working copy.
    ///
    /// Rows already present in the working copy win (`INSERT OR IGNORE`).
    /// Tables whose names are not valid identifiers, or whose shape does not
    /// match `(key, value)`, are skipped with a warning.
    ///
    /// ## Returns
    /// * `Ok(n)` - Number of rows inserted across all tables
    pub fn merge_from(&self, path: &Path) -> StoreResult<usize> {
        let inner = self.inner.lock();
        let conn = &inner.conn;
        conn.execute("ATTACH DATABASE ?1 AS disk", params![path.to_string_lossy().into_owned()])?;
        let merged = merge_attached(conn);
        if let Err(e) = conn.execute("DETACH DATABASE disk", []) {
            warn!(error = %e, "detach snapshot failed");
        }
        merged
    }
}

fn merge_attached(conn: &Connection) -> StoreResult<usize> {
    let names = {
        let mut stmt = conn.prepare(
            "SELECT name FROM disk.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
    };

    let mut merged = 0;
    for name in names {
        match sanitize_table_name(&name) {
            Ok(clean) if clean == name => {}
            _ => {
                warn!(table = %name, "skipping snapshot table with invalid name");
                continue;
            }
        }
        let q = quote_ident(&name);
        let res = create_table(conn, &name).and_then(|_| {
            conn.execute(
                &format!("INSERT OR IGNORE INTO main.{q} (key, value) SELECT key, value FROM disk.{q}"),
                [],
            )
            .map_err(StoreError::from)
        });
        match res {
            Ok(n) => {
                debug!(table = %name, rows = n, "merged snapshot table");
                merged += n;
            }
            Err(e) => warn!(table = %name, error = %e, "skipping snapshot table"),
        }
    }
    Ok(merged)
}

/// Reduces a requested table name to `[A-Za-z0-9_]`.
///
/// Other characters are stripped rather than rejected; a name that is empty
/// afterwards is an error.
pub fn sanitize_table_name(raw: &str) -> StoreResult<String> {
    let name: String = raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    if name.is_empty() {
        return Err(StoreError::invalid(format!("Invalid table name '{}'", raw)));
    }
    Ok(name)
}

/// Quotes an already-sanitized identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn create_table(conn: &Connection, name: &str) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS main.{} (key TEXT PRIMARY KEY, value TEXT)",
        quote_ident(name)
    ))?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> StoreResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn run_raw(conn: &Connection, sql: &str) -> StoreResult<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            obj.insert(name.clone(), json_at(row, i)?);
        }
        out.push(obj);
    }
    Ok(out)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record { key: text_at(row, 0)?, value: text_at(row, 1)? })
}

/// Reads a column as text whatever its storage class. Rows written through
/// the raw passthrough may hold integers, reals or NULL in either column.
fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => String::new(),
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    })
}

fn json_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    })
}

/// Flattens a JSON object into `(key, value)` pairs for `init` and `load`.
///
/// A JSON string holding an object is accepted too, since shell clients send
/// inline data as text. String values are stored verbatim; every other value
/// is stored as its JSON text.
pub fn entries_from_json(doc: &Value) -> StoreResult<Vec<(String, String)>> {
    let parsed;
    let doc = match doc {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s)?;
            &parsed
        }
        other => other,
    };
    let obj = doc
        .as_object()
        .ok_or_else(|| StoreError::invalid("Expected a JSON object of key/value pairs"))?;
    Ok(obj
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect())
}
