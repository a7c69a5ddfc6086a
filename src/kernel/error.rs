//! Error types for kernel operations.
//!
//! This module defines the canonical error type used throughout the kernel.
//! All subsystems return `Result<T, KernelError>` for error handling.

use crate::kernel::capability::DenyReason;
use crate::kernel::provenance::Provenance;
use rusqlite;
use std::io;
use thiserror::Error;

/// Canonical error type for all kernel operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Variants auto-convert from `rusqlite::Error` and `std::io::Error` via `#[from]`.
#[derive(Error, Debug)]
pub enum KernelError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No live capability authorizes the requested operation
    #[error("capability denied for {principal}: {op} on {resource} ({})", .reason.as_str())]
    CapabilityDenied {
        principal: String,
        op: String,
        resource: String,
        reason: DenyReason,
    },

    /// Object registry lookup miss
    #[error("object not found: {id}")]
    ObjectNotFound { id: String },

    /// Update pre-condition did not match the live value
    #[error("object conflict on {id}: expected {expected}, found {actual}")]
    ObjectConflict {
        id: String,
        expected: String,
        actual: String,
    },

    /// Transition attempted on a terminal transaction
    #[error("transaction {tx_id} is {state}")]
    TransactionClosed { tx_id: String, state: String },

    /// Rollback attempted across a committed irreversible operation
    #[error("irreversible operation {op} already committed in {tx_id}")]
    IrreversibleOperation { op: String, tx_id: String },

    /// Mediation-boundary refusal (capability firewall)
    #[error("security rule '{rule}' refused {op} (provenance {})", .provenance.as_str())]
    Security {
        rule: String,
        op: String,
        provenance: Provenance,
    },

    /// Submission exhausted a runtime budget
    #[error("quota exceeded: {kind}")]
    QuotaExceeded { kind: String },

    /// Wall-clock deadline passed at a mediated call boundary
    #[error("timed out in {op} after {budget_ms}ms")]
    Timeout { op: String, budget_ms: u64 },

    /// Submission cancelled by a supervisor
    #[error("cancelled during {op}")]
    Cancelled { op: String },

    /// Renderer collaborator failure; `transient` failures may be retried
    #[error("renderer error: {cause}")]
    Renderer { cause: String, transient: bool },

    /// Audit append failure. Fatal for the originating operation: the
    /// operation must not be treated as allowed (fail-closed).
    #[error("audit write failed: {cause}")]
    AuditWrite { cause: String },

    /// Audit query failure (recoverable)
    #[error("audit query failed: {cause}")]
    AuditQuery { cause: String },

    /// Pre-execution admission or input validation failure
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (missing capability id, checkpoint label, etc.)
    #[error("not found: {0}")]
    NotFound(String),
}

impl KernelError {
    /// Stable `error_kind` label recorded in audit entries.
    pub fn kind_label(&self) -> &'static str {
        match self {
            KernelError::Rusqlite(_) => "storage",
            KernelError::Io(_) => "io",
            KernelError::CapabilityDenied { reason, .. } => reason.as_str(),
            KernelError::ObjectNotFound { .. } => "object_not_found",
            KernelError::ObjectConflict { .. } => "object_conflict",
            KernelError::TransactionClosed { .. } => "transaction_closed",
            KernelError::IrreversibleOperation { .. } => "irreversible",
            KernelError::Security { .. } => "firewall",
            KernelError::QuotaExceeded { .. } => "quota_exceeded",
            KernelError::Timeout { .. } => "timeout",
            KernelError::Cancelled { .. } => "cancelled",
            KernelError::Renderer { .. } => "renderer",
            KernelError::AuditWrite { .. } => "audit_write",
            KernelError::AuditQuery { .. } => "audit_query",
            KernelError::Validation(_) => "validation",
            KernelError::NotFound(_) => "not_found",
        }
    }
}
