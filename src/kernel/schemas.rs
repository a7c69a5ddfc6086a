// src/kernel/schemas.rs
// Centralized database schema definitions for the kernel's durable store.

pub const KERNEL_DB_NAME: &str = "kernel.db";

// --- Audit ---
pub const AUDIT_DB_SCHEMA_ENTRIES: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        id TEXT PRIMARY KEY,
        ts REAL NOT NULL,
        principal TEXT NOT NULL,
        op TEXT NOT NULL,
        object TEXT,
        args BLOB NOT NULL,
        result TEXT NOT NULL,
        error_kind TEXT,
        tx_id TEXT,
        cp_id TEXT,
        provenance TEXT NOT NULL,
        risk_tier TEXT,
        prev_id TEXT
    )
";

pub const AUDIT_DB_INDEX_PRINCIPAL_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_principal_ts ON entries(principal, ts)";
pub const AUDIT_DB_INDEX_OP: &str = "CREATE INDEX IF NOT EXISTS idx_entries_op ON entries(op)";
pub const AUDIT_DB_INDEX_TX: &str = "CREATE INDEX IF NOT EXISTS idx_entries_tx ON entries(tx_id)";

// --- Grants ---
// Re-emitted at startup; a revocation tombstone always overrides a
// re-emitted grant, so zombie tokens are impossible.
pub const GRANT_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS grants (
        cap_id TEXT PRIMARY KEY,
        principal TEXT NOT NULL,
        operation TEXT NOT NULL,
        resource TEXT NOT NULL,
        risk_tier TEXT NOT NULL,
        expires_at REAL,
        constraints TEXT NOT NULL,
        issued_at REAL NOT NULL
    )
";

pub const GRANT_DB_INDEX_PRINCIPAL: &str =
    "CREATE INDEX IF NOT EXISTS idx_grants_principal ON grants(principal)";

// --- Revocations ---
pub const REVOCATION_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS revocations (
        cap_id TEXT PRIMARY KEY,
        principal TEXT NOT NULL,
        revoked_at REAL NOT NULL,
        reason TEXT NOT NULL
    )
";

pub const REVOCATION_DB_INDEX_PRINCIPAL: &str =
    "CREATE INDEX IF NOT EXISTS idx_revocations_principal ON revocations(principal)";

// --- Meta (redaction salt row) ---
pub const KERNEL_META_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kernel_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const META_KEY_REDACTION_SALT: &str = "redaction_salt";
