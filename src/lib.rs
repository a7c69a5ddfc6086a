//! Portcullis: a browser kernel for untrusted agent code.
//!
//! **Portcullis is the privileged mediation layer between machine-generated
//! agent code and the browser-local resources it manipulates** (tabs,
//! forms, workspaces, credentials). Every privileged operation is:
//!
//! - **authorized** against an unforgeable capability,
//! - **observable** through an append-only, secret-redacting audit record,
//! - **reversible** within a transactional envelope for browser-local state.
//!
//! # Architecture
//!
//! Five subsystems form the trusted computing base, leaves first:
//!
//! 1. [`kernel::audit`]: durable, append-only record with per-principal
//!    causal chaining and salted-hash redaction of sensitive names.
//! 2. [`kernel::object`]: canonical registry of typed resources behind
//!    stable, never-reused `type:counter` ids.
//! 3. [`kernel::capability`]: grant/check/require/revoke with glob
//!    patterns, risk tiers, constraints, and restart-durable tombstones.
//! 4. [`kernel::transaction`]: nestable transactions with named
//!    checkpoints, hybrid copy-on-write snapshots, and a commit boundary
//!    against irreversible operations.
//! 5. [`runtime`]: static code admission, dry-run capability inference,
//!    and the mediated `browser.*` surface with a provenance firewall.
//!
//! The kernel never rolls back external side effects (a submitted form
//! stays submitted); it restores browser-local state only. Only audit
//! entries, revocation tombstones, and the redaction salt are durable
//! across restart.
//!
//! # Example
//!
//! ```no_run
//! use portcullis::kernel::{Kernel, config::KernelConfig, store::Store};
//! use portcullis::kernel::capability::{Constraints, RiskTier};
//! use std::path::Path;
//!
//! let kernel = Kernel::init(
//!     Store::at(Path::new(".portcullis")),
//!     KernelConfig::default(),
//! ).unwrap();
//! kernel.broker.grant(
//!     "agent:1", "tab.*", "tab:*", RiskTier::T1Read, None, Constraints::default(),
//! ).unwrap();
//! ```

pub mod cli;
pub mod kernel;
pub mod runtime;

pub use kernel::Kernel;
pub use kernel::error::KernelError;
