//! Store abstraction for the kernel's durable state.
//!
//! A `Store` is the on-disk root for everything that survives a process
//! restart: the audit log, capability revocation tombstones, and the
//! redaction salt. Objects and transactions are process-lifetime and are
//! never written here.

use std::path::{Path, PathBuf};

/// Handle to the kernel's durable store root.
///
/// Everything durable lives in a single SQLite database under this root;
/// see `schemas` for the table layout.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Path of the kernel database (audit entries, revocations, meta).
    pub fn kernel_db_path(&self) -> PathBuf {
        self.root.join(crate::kernel::schemas::KERNEL_DB_NAME)
    }
}
