//! Database connection and initialization utilities.
//!
//! Low-level connection primitives for the kernel's single durable store.
//! The audit log owns its connection exclusively; the capability broker
//! opens a second connection for tombstone writes (WAL makes this safe).

use crate::kernel::error::KernelError;
use crate::kernel::schemas;
use crate::kernel::store::Store;
use rusqlite::Connection;
use std::fs;

/// Establish a SQLite connection with the kernel's standard configuration.
///
/// Enables:
/// - WAL (Write-Ahead Logging) mode for better concurrency
/// - Foreign key constraints
/// - 5-second busy timeout for lock contention
pub fn db_connect(db_path: &str) -> Result<Connection, KernelError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(KernelError::Rusqlite)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(KernelError::Rusqlite)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(KernelError::Rusqlite)?;
    Ok(conn)
}

/// Create the kernel database and all durable tables if absent.
pub fn initialize_kernel_db(store: &Store) -> Result<(), KernelError> {
    fs::create_dir_all(&store.root).map_err(KernelError::Io)?;
    let db_path = store.kernel_db_path();
    let conn = db_connect(&db_path.to_string_lossy())?;

    conn.execute(schemas::AUDIT_DB_SCHEMA_ENTRIES, [])?;
    conn.execute(schemas::AUDIT_DB_INDEX_PRINCIPAL_TS, [])?;
    conn.execute(schemas::AUDIT_DB_INDEX_OP, [])?;
    conn.execute(schemas::AUDIT_DB_INDEX_TX, [])?;
    conn.execute(schemas::GRANT_DB_SCHEMA, [])?;
    conn.execute(schemas::GRANT_DB_INDEX_PRINCIPAL, [])?;
    conn.execute(schemas::REVOCATION_DB_SCHEMA, [])?;
    conn.execute(schemas::REVOCATION_DB_INDEX_PRINCIPAL, [])?;
    conn.execute(schemas::KERNEL_META_SCHEMA, [])?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_initialize_kernel_db_creates_tables() {
        let tmp = tempdir().expect("tempdir");
        let store = Store::at(tmp.path());
        initialize_kernel_db(&store).expect("init");

        let conn = db_connect(&store.kernel_db_path().to_string_lossy()).expect("connect");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('entries','revocations','kernel_meta')",
                [],
                |row| row.get(0),
            )
            .expect("table count");
        assert_eq!(count, 3);

        let fk_on: i64 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("pragma foreign_keys");
        assert_eq!(fk_on, 1);
    }
}
