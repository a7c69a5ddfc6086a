//! Kernel configuration.
//!
//! Loaded from an optional JSON file; every field has a serde default so a
//! missing or partial file degrades to the documented defaults rather than
//! failing startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Privileged-call budget per submission.
    #[serde(default = "default_op_budget")]
    pub op_budget: u64,
    /// Wall-clock timeout per submission, milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Best-effort memory high-water mark per submission, bytes.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,
    /// Pre-images at or under this serialized size are copied by value;
    /// larger payloads are snapshotted by reference.
    #[serde(default = "default_snapshot_copy_max_bytes")]
    pub snapshot_copy_max_bytes: usize,
    /// Retained displaced-version slots in the object manager's ring.
    #[serde(default = "default_version_ring_capacity")]
    pub version_ring_capacity: usize,
    /// Bounded retries for transient renderer failures.
    #[serde(default = "default_renderer_retries")]
    pub renderer_retries: u32,
    /// Base backoff between renderer retries, milliseconds (doubles per attempt).
    #[serde(default = "default_renderer_backoff_ms")]
    pub renderer_backoff_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            op_budget: default_op_budget(),
            timeout_ms: default_timeout_ms(),
            memory_budget_bytes: default_memory_budget_bytes(),
            snapshot_copy_max_bytes: default_snapshot_copy_max_bytes(),
            version_ring_capacity: default_version_ring_capacity(),
            renderer_retries: default_renderer_retries(),
            renderer_backoff_ms: default_renderer_backoff_ms(),
        }
    }
}

impl KernelConfig {
    /// Load config from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn maybe_load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }
}

fn default_op_budget() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_memory_budget_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_snapshot_copy_max_bytes() -> usize {
    10 * 1024
}

fn default_version_ring_capacity() -> usize {
    64
}

fn default_renderer_retries() -> u32 {
    3
}

fn default_renderer_backoff_ms() -> u64 {
    25
}
