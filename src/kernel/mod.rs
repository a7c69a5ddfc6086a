//! Core kernel subsystems: the trusted computing base between untrusted
//! agent code and browser-local state.
//!
//! ## Module Overview
//!
//! - **`audit`**: Append-only, causally linked, secret-redacting log
//! - **`object`**: Canonical registry of typed resources with stable ids
//! - **`capability`**: Authorization decisions with durable revocation
//! - **`transaction`**: Checkpoints, hybrid snapshots, rollback, commit gating
//! - **`renderer`**: Opaque renderer collaborator boundary (+ mock)
//! - **`approval`**: Human governance collaborator boundary
//! - **`store`** / **`db`** / **`schemas`**: Durable-store plumbing
//! - **`config`** / **`error`** / **`time`** / **`pattern`** / **`provenance`**: shared primitives
//!
//! Subsystems are wired once through `Kernel::init` and passed to
//! dependents as explicit parameters; there is no ambient global access.

pub mod approval;
pub mod audit;
pub mod capability;
pub mod config;
pub mod db;
pub mod error;
pub mod object;
pub mod pattern;
pub mod provenance;
pub mod renderer;
pub mod schemas;
pub mod store;
pub mod time;
pub mod transaction;

use crate::kernel::audit::AuditLog;
use crate::kernel::capability::CapabilityBroker;
use crate::kernel::config::KernelConfig;
use crate::kernel::error::KernelError;
use crate::kernel::object::ObjectManager;
use crate::kernel::store::Store;
use crate::kernel::transaction::Coordinator;
use std::sync::Arc;

/// The wired kernel: one per process (or per test).
///
/// `init` builds the subsystems leaves-first; `shutdown` forcibly aborts
/// any transaction still active. Audit entries and revocations survive
/// restart; objects and transactions do not.
pub struct Kernel {
    pub store: Store,
    pub config: KernelConfig,
    pub audit: Arc<AuditLog>,
    pub objects: Arc<ObjectManager>,
    pub broker: Arc<CapabilityBroker>,
    pub coordinator: Arc<Coordinator>,
}

impl Kernel {
    pub fn init(store: Store, config: KernelConfig) -> Result<Self, KernelError> {
        let audit = Arc::new(AuditLog::open(&store)?);
        let objects = Arc::new(ObjectManager::new(config.version_ring_capacity));
        let broker = Arc::new(CapabilityBroker::open(&store, Arc::clone(&audit))?);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&objects),
            Arc::clone(&audit),
            config.snapshot_copy_max_bytes,
        ));
        Ok(Self {
            store,
            config,
            audit,
            objects,
            broker,
            coordinator,
        })
    }

    /// Abort everything still active. Idempotent.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        self.coordinator.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_and_shutdown() {
        let tmp = tempdir().expect("tempdir");
        let kernel = Kernel::init(Store::at(tmp.path()), KernelConfig::default()).expect("init");
        let tx = kernel.coordinator.begin("agent:1", None).expect("begin");
        kernel.shutdown().expect("shutdown");
        assert_eq!(
            kernel.coordinator.state(tx),
            Some(crate::kernel::transaction::TxState::Aborted)
        );
    }
}
