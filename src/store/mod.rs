// =============================================================================
// Persistent store — rusqlite behind a single connection
// =============================================================================
//
// One `Store` owns the connection behind a parking_lot::Mutex. All calls are
// synchronous and short; no lock is ever held across an await point. Every
// multi-row atomic operation (delivery consumption + intent insert, the exit
// intent APPROVED->PLACED compare-and-set, versioned trade updates) is a
// single SQL transaction or a single predicated UPDATE.
// =============================================================================

mod accounts;
mod candles;
mod deliveries;
mod exits;
mod instruments;
mod intents;
mod portfolios;
mod schema;
mod signals;
mod trades;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::info;

/// Handle to the engine's SQLite database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("failed to apply schema")?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and FEED_COLLECTOR mode.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// ---------------------------------------------------------------------------
// Column helpers shared by the per-entity modules
// ---------------------------------------------------------------------------

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Read a decimal stored as canonical text.
pub(crate) fn col_dec(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn col_dec_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Decimal::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

/// Read a string-backed enum column.
pub(crate) fn col_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_err(idx, e))
}

pub(crate) fn col_enum_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse::<T>().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

/// Read a JSON column into a typed value.
pub(crate) fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

/// Serialise a decimal for storage.
pub(crate) fn dec_sql(d: Decimal) -> String {
    d.to_string()
}

pub(crate) fn dec_sql_opt(d: Option<Decimal>) -> Option<String> {
    d.map(|d| d.to_string())
}

/// Serialise a value into a JSON column.
pub(crate) fn json_sql<T: serde::Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).context("failed to serialise JSON column")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_cleanly_twice() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute_batch(schema::SCHEMA_SQL)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn open_on_disk_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let _store = Store::open(&path).unwrap();
        assert!(path.exists());
    }
}
