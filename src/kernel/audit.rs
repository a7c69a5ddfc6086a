//! Append-only audit log with causal chaining and secret redaction.
//!
//! Every privileged operation lands here exactly once, after the broker's
//! allow decision and after any snapshot it requires. The store is a durable
//! SQLite table keyed by entry id; within a single principal's stream the
//! `prev_id` chain is dense, giving replayable causal order. There is no
//! update and no delete path.
//!
//! Disk errors on append are fatal for the originating operation: an
//! operation whose audit record cannot be persisted is treated as not
//! allowed. Query errors are recoverable.

use crate::kernel::capability::RiskTier;
use crate::kernel::db;
use crate::kernel::error::KernelError;
use crate::kernel::pattern;
use crate::kernel::provenance::Provenance;
use crate::kernel::schemas;
use crate::kernel::store::Store;
use crate::kernel::time;
use rusqlite::{Connection, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Mutex;
use uuid::Uuid;

/// Outcome recorded for an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Denied,
    Error,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Denied => "denied",
            AuditResult::Error => "error",
        }
    }

    fn parse(s: &str) -> AuditResult {
        match s {
            "success" => AuditResult::Success,
            "denied" => AuditResult::Denied,
            _ => AuditResult::Error,
        }
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub ts: f64,
    pub principal: String,
    pub op: String,
    pub object_id: Option<String>,
    /// Redacted argument record; secret values never survive into here.
    pub args: JsonValue,
    pub result: AuditResult,
    pub error_kind: Option<String>,
    pub tx_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub provenance: Provenance,
    pub risk_tier: Option<RiskTier>,
    /// Causal link to the previous entry in this principal's stream.
    pub prev_id: Option<Uuid>,
}

/// Fields the caller supplies; id, timestamp, chain link, and redaction are
/// the log's business.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub principal: String,
    pub op: String,
    pub object_id: Option<String>,
    pub args: JsonValue,
    pub result: AuditResult,
    pub error_kind: Option<String>,
    pub tx_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub provenance: Provenance,
    pub risk_tier: Option<RiskTier>,
}

impl AuditDraft {
    pub fn new(principal: &str, op: &str, result: AuditResult) -> Self {
        Self {
            principal: principal.to_string(),
            op: op.to_string(),
            object_id: None,
            args: JsonValue::Null,
            result,
            error_kind: None,
            tx_id: None,
            checkpoint_id: None,
            provenance: Provenance::System,
            risk_tier: None,
        }
    }

    pub fn object(mut self, id: &str) -> Self {
        self.object_id = Some(id.to_string());
        self
    }

    pub fn args(mut self, args: JsonValue) -> Self {
        self.args = args;
        self
    }

    pub fn error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }

    pub fn tx(mut self, tx_id: Option<String>, checkpoint_id: Option<String>) -> Self {
        self.tx_id = tx_id;
        self.checkpoint_id = checkpoint_id;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn risk(mut self, tier: RiskTier) -> Self {
        self.risk_tier = Some(tier);
        self
    }
}

/// Filter expression over the indexed entry fields. `op_glob` supports
/// segment globbing (`tab.*`).
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub principal: Option<String>,
    pub op_glob: Option<String>,
    pub result: Option<AuditResult>,
    pub tx_id: Option<String>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub limit: Option<usize>,
}

/// Export formats for `AuditLog::export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Jsonl,
    Markdown,
}

/// Durable, append-only audit store. A single writer owns the connection;
/// readers share it behind the same lock (appends are bounded-time).
pub struct AuditLog {
    conn: Mutex<Connection>,
    salt: String,
    heads: Mutex<FxHashMap<String, Uuid>>,
}

impl AuditLog {
    /// Open (initializing if needed) the audit store under `store`, load or
    /// mint the redaction salt, and recover per-principal chain heads.
    pub fn open(store: &Store) -> Result<Self, KernelError> {
        db::initialize_kernel_db(store)?;
        let conn = db::db_connect(&store.kernel_db_path().to_string_lossy())?;

        let salt = load_or_create_salt(&conn)?;

        let mut heads = FxHashMap::default();
        {
            let mut stmt = conn.prepare(
                "SELECT principal, id FROM entries
                 WHERE rowid IN (SELECT MAX(rowid) FROM entries GROUP BY principal)",
            )?;
            let rows = stmt.query_map([], |row| {
                let principal: String = row.get(0)?;
                let id: String = row.get(1)?;
                Ok((principal, id))
            })?;
            for row in rows {
                let (principal, id) = row?;
                if let Ok(id) = Uuid::parse_str(&id) {
                    heads.insert(principal, id);
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            salt,
            heads: Mutex::new(heads),
        })
    }

    /// Append one entry. Fail-closed: any storage error surfaces as
    /// `AuditWrite` and the caller must treat its operation as not allowed.
    pub fn log(&self, draft: AuditDraft) -> Result<Uuid, KernelError> {
        let id = Uuid::new_v4();
        let ts = time::now_secs();
        let args = redact_value(&self.salt, &draft.args);
        let args_blob = serde_json::to_vec(&args)
            .map_err(|e| KernelError::AuditWrite { cause: e.to_string() })?;

        let mut heads = self
            .heads
            .lock()
            .map_err(|_| KernelError::AuditWrite { cause: "head lock poisoned".to_string() })?;
        let prev_id = heads.get(&draft.principal).copied();

        let conn = self
            .conn
            .lock()
            .map_err(|_| KernelError::AuditWrite { cause: "writer lock poisoned".to_string() })?;
        conn.execute(
            "INSERT INTO entries(id, ts, principal, op, object, args, result, error_kind, tx_id, cp_id, provenance, risk_tier, prev_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id.to_string(),
                ts,
                draft.principal,
                draft.op,
                draft.object_id,
                args_blob,
                draft.result.as_str(),
                draft.error_kind,
                draft.tx_id,
                draft.checkpoint_id,
                draft.provenance.as_str(),
                draft.risk_tier.map(|t| t.as_str().to_string()),
                prev_id.map(|p| p.to_string()),
            ],
        )
        .map_err(|e| KernelError::AuditWrite { cause: e.to_string() })?;

        heads.insert(draft.principal, id);
        Ok(id)
    }

    /// Run a filter over the store. Errors are recoverable (`AuditQuery`).
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, KernelError> {
        let op_re = match &filter.op_glob {
            Some(glob) => Some(
                pattern::op_glob(glob)
                    .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?,
            ),
            None => None,
        };

        let mut sql = String::from(
            "SELECT id, ts, principal, op, object, args, result, error_kind, tx_id, cp_id, provenance, risk_tier, prev_id
             FROM entries WHERE 1=1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(principal) = &filter.principal {
            sql.push_str(" AND principal = ?");
            binds.push(Box::new(principal.clone()));
        }
        if let Some(result) = filter.result {
            sql.push_str(" AND result = ?");
            binds.push(Box::new(result.as_str().to_string()));
        }
        if let Some(tx_id) = &filter.tx_id {
            sql.push_str(" AND tx_id = ?");
            binds.push(Box::new(tx_id.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND ts >= ?");
            binds.push(Box::new(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND ts <= ?");
            binds.push(Box::new(until));
        }
        sql.push_str(" ORDER BY rowid ASC");

        let conn = self
            .conn
            .lock()
            .map_err(|_| KernelError::AuditQuery { cause: "writer lock poisoned".to_string() })?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;
        let params: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), row_to_entry)
            .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;

        let mut out = Vec::new();
        for row in rows {
            let entry = row.map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;
            if let Some(re) = &op_re {
                if !re.is_match(&entry.op) {
                    continue;
                }
            }
            out.push(entry);
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Most recent entry across all streams.
    pub fn last(&self) -> Result<Option<AuditEntry>, KernelError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| KernelError::AuditQuery { cause: "writer lock poisoned".to_string() })?;
        let mut stmt = conn
            .prepare(
                "SELECT id, ts, principal, op, object, args, result, error_kind, tx_id, cp_id, provenance, risk_tier, prev_id
                 FROM entries ORDER BY rowid DESC LIMIT 1",
            )
            .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;
        let mut rows = stmt
            .query_map([], row_to_entry)
            .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?,
            )),
            None => Ok(None),
        }
    }

    /// Most recent entry in one principal's stream.
    pub fn last_for(&self, principal: &str) -> Result<Option<AuditEntry>, KernelError> {
        let entries = self.query(&AuditFilter {
            principal: Some(principal.to_string()),
            ..AuditFilter::default()
        })?;
        Ok(entries.into_iter().last())
    }

    /// Export matching entries to `sink`. The redaction salt never leaves
    /// the store; exported names show only their salted hashes.
    pub fn export(
        &self,
        format: ExportFormat,
        filter: &AuditFilter,
        sink: &mut dyn Write,
    ) -> Result<usize, KernelError> {
        let entries = self.query(filter)?;
        match format {
            ExportFormat::Jsonl => {
                for entry in &entries {
                    let line = serde_json::to_string(entry)
                        .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;
                    writeln!(sink, "{}", line).map_err(KernelError::Io)?;
                }
            }
            ExportFormat::Markdown => {
                writeln!(sink, "# Kernel Audit Transcript\n").map_err(KernelError::Io)?;
                writeln!(sink, "Exported: {}", time::now_epoch_z()).map_err(KernelError::Io)?;
                writeln!(sink, "Total Entries: {}\n", entries.len()).map_err(KernelError::Io)?;
                writeln!(sink, "---\n").map_err(KernelError::Io)?;
                for entry in &entries {
                    writeln!(sink, "### {} - {}\n", entry.ts, entry.op).map_err(KernelError::Io)?;
                    writeln!(sink, "- **Entry:** {}", entry.id).map_err(KernelError::Io)?;
                    writeln!(sink, "- **Principal:** {}", entry.principal)
                        .map_err(KernelError::Io)?;
                    writeln!(sink, "- **Result:** {}", entry.result.as_str())
                        .map_err(KernelError::Io)?;
                    if let Some(object) = &entry.object_id {
                        writeln!(sink, "- **Object:** {}", object).map_err(KernelError::Io)?;
                    }
                    if let Some(kind) = &entry.error_kind {
                        writeln!(sink, "- **Error:** {}", kind).map_err(KernelError::Io)?;
                    }
                    if let Some(tx) = &entry.tx_id {
                        writeln!(sink, "- **Transaction:** {}", tx).map_err(KernelError::Io)?;
                    }
                    writeln!(sink).map_err(KernelError::Io)?;
                }
            }
        }
        Ok(entries.len())
    }

    /// Salted hash of a sensitive name, for in-process query matching
    /// against redacted keys.
    pub fn hashed_name(&self, name: &str) -> String {
        salted_name_hash(&self.salt, name)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let id: String = row.get(0)?;
    let args_blob: Vec<u8> = row.get(5)?;
    let result: String = row.get(6)?;
    let provenance: String = row.get(10)?;
    let risk: Option<String> = row.get(11)?;
    let prev: Option<String> = row.get(12)?;
    Ok(AuditEntry {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        ts: row.get(1)?,
        principal: row.get(2)?,
        op: row.get(3)?,
        object_id: row.get(4)?,
        args: serde_json::from_slice(&args_blob).unwrap_or(JsonValue::Null),
        result: AuditResult::parse(&result),
        error_kind: row.get(7)?,
        tx_id: row.get(8)?,
        checkpoint_id: row.get(9)?,
        provenance: parse_provenance(&provenance),
        risk_tier: risk.as_deref().and_then(RiskTier::parse),
        prev_id: prev.and_then(|p| Uuid::parse_str(&p).ok()),
    })
}

fn parse_provenance(s: &str) -> Provenance {
    match s {
        "user" => Provenance::User,
        "agent" => Provenance::Agent,
        "web-content" => Provenance::WebContent,
        _ => Provenance::System,
    }
}

fn load_or_create_salt(conn: &Connection) -> Result<String, KernelError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM kernel_meta WHERE key = ?1",
            params![schemas::META_KEY_REDACTION_SALT],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    if let Some(salt) = existing {
        return Ok(salt);
    }
    let salt = time::new_ulid();
    conn.execute(
        "INSERT INTO kernel_meta(key, value) VALUES (?1, ?2)",
        params![schemas::META_KEY_REDACTION_SALT, salt],
    )?;
    Ok(salt)
}

const SENSITIVE_EXACT: &[&str] = &["auth", "pwd", "email"];
const SENSITIVE_SUBSTR: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "cookie",
    "api_key",
    "apikey",
    "credential",
    "bearer",
    "authorization",
];

fn is_sensitive_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_EXACT.iter().any(|s| *s == lower)
        || SENSITIVE_SUBSTR.iter().any(|s| lower.contains(s))
}

fn salted_name_hash(salt: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(name.to_lowercase().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Walk an args value, replacing every sensitive-named key with a salted
/// hash of the name and a `"<redacted>"` value. Secret values never reach
/// the durable store.
pub fn redact_value(salt: &str, value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_sensitive_name(key) {
                    out.insert(
                        format!("{}#{}", key, salted_name_hash(salt, key)),
                        JsonValue::String("<redacted>".to_string()),
                    );
                } else {
                    out.insert(key.clone(), redact_value(salt, inner));
                }
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| redact_value(salt, v)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_names() {
        assert!(is_sensitive_name("password"));
        assert!(is_sensitive_name("API_KEY"));
        assert!(is_sensitive_name("session_token"));
        assert!(is_sensitive_name("auth"));
        assert!(!is_sensitive_name("url"));
        assert!(!is_sensitive_name("title"));
    }

    #[test]
    fn test_redaction_replaces_values_and_hashes_names() {
        let args = json!({
            "url": "https://a.test",
            "password": "hunter2",
            "nested": {"api_key": "sk-12345", "kind": "login"}
        });
        let redacted = redact_value("salt", &args);
        let text = redacted.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("sk-12345"));
        assert!(text.contains("<redacted>"));
        assert!(text.contains("https://a.test"));
        // Hashed key form: name#<16 hex chars>.
        let expected = format!("password#{}", salted_name_hash("salt", "password"));
        assert!(redacted.get(&expected).is_some());
    }

    #[test]
    fn test_redaction_is_salt_stable() {
        let a = salted_name_hash("s1", "password");
        let b = salted_name_hash("s1", "password");
        let c = salted_name_hash("s2", "password");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
