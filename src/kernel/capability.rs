//! Capability Broker: authorization decisions with durable revocation.
//!
//! A capability is an unforgeable record binding `(principal, operation
//! pattern, resource pattern, risk tier, constraints)`. `check`/`require`
//! search the principal's live capabilities for any match; presence of one
//! match is sufficient. Revocations are written to a durable tombstone
//! store before the call returns, so a revoked capability is never
//! satisfiable again, even after restart. Expired capabilities are kept,
//! not deleted, so deny reasons stay precise.
//!
//! Every `check`/`require` call emits exactly one audit entry; an audit
//! append failure fails the decision closed.

use crate::kernel::audit::{AuditDraft, AuditLog, AuditResult};
use crate::kernel::db;
use crate::kernel::error::KernelError;
use crate::kernel::pattern;
use crate::kernel::provenance::Provenance;
use crate::kernel::store::Store;
use crate::kernel::time;
use regex::Regex;
use rusqlite::{Connection, params};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Risk tiers controlling approval and rollback rules.
///
/// - T1: auto-grantable reads; always logged.
/// - T2: stateful but rollback-safe; explicit grant required.
/// - T3: irreversible; human approval per execution boundary, never rolled
///   back after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskTier {
    #[serde(rename = "T1_READ")]
    T1Read,
    #[serde(rename = "T2_STATEFUL")]
    T2Stateful,
    #[serde(rename = "T3_IRREVERSIBLE")]
    T3Irreversible,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::T1Read => "T1_READ",
            RiskTier::T2Stateful => "T2_STATEFUL",
            RiskTier::T3Irreversible => "T3_IRREVERSIBLE",
        }
    }

    pub fn parse(s: &str) -> Option<RiskTier> {
        match s {
            "T1_READ" => Some(RiskTier::T1Read),
            "T2_STATEFUL" => Some(RiskTier::T2Stateful),
            "T3_IRREVERSIBLE" => Some(RiskTier::T3Irreversible),
            _ => None,
        }
    }
}

/// Why a capability lookup failed. Absence, expiry, revocation, and a live
/// match with failing constraints are all equivalent to absence for
/// authorization purposes, but the reason is preserved for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoGrant,
    Expired,
    Revoked,
    ConstraintFailed,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NoGrant => "no_grant",
            DenyReason::Expired => "expired",
            DenyReason::Revoked => "revoked",
            DenyReason::ConstraintFailed => "constraint_failed",
        }
    }

    /// Precedence when several capabilities miss for different reasons: the
    /// reason closest to success wins.
    fn rank(self) -> u8 {
        match self {
            DenyReason::ConstraintFailed => 3,
            DenyReason::Expired => 2,
            DenyReason::Revoked => 1,
            DenyReason::NoGrant => 0,
        }
    }
}

/// Token-bucket rate limit attached to a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Seconds-of-day window (UTC). `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_sec: u32,
    pub end_sec: u32,
}

impl TimeWindow {
    fn contains(&self, sec_of_day: u32) -> bool {
        if self.start_sec <= self.end_sec {
            sec_of_day >= self.start_sec && sec_of_day < self.end_sec
        } else {
            sec_of_day >= self.start_sec || sec_of_day < self.end_sec
        }
    }
}

/// Optional constraints narrowing a grant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    /// URL glob checked against a URL supplied in the call, when present.
    pub url_glob: Option<String>,
    pub rate: Option<RateLimit>,
    pub window: Option<TimeWindow>,
    /// Remaining uses for single-use grants (approve-once flows). Reaching
    /// zero revokes the capability durably.
    pub uses_remaining: Option<u32>,
}

/// An issued capability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub principal: String,
    pub operation_pattern: String,
    pub resource_pattern: String,
    pub risk_tier: RiskTier,
    pub expires_at: Option<f64>,
    pub constraints: Constraints,
    pub revoked: bool,
    pub issued_at: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: f64,
}

struct CapEntry {
    cap: Capability,
    op_re: Regex,
    res_re: Regex,
    url_re: Option<Regex>,
    bucket: Option<Mutex<BucketState>>,
}

/// Authorization decision point. The capability set sits behind a single
/// lock (contention is low); tombstones go to the durable store before any
/// revocation returns.
pub struct CapabilityBroker {
    caps: Mutex<Vec<CapEntry>>,
    revoked_ids: Mutex<FxHashSet<String>>,
    conn: Mutex<Connection>,
    audit: Arc<AuditLog>,
}

impl CapabilityBroker {
    /// Open the broker over the kernel store. Grants are re-emitted from
    /// the durable store and revocation tombstones are applied on top, so
    /// no revoked capability can be satisfied after restart.
    pub fn open(store: &Store, audit: Arc<AuditLog>) -> Result<Self, KernelError> {
        db::initialize_kernel_db(store)?;
        let conn = db::db_connect(&store.kernel_db_path().to_string_lossy())?;

        let mut revoked_ids = FxHashSet::default();
        {
            let mut stmt = conn.prepare("SELECT cap_id FROM revocations")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                revoked_ids.insert(row?);
            }
        }

        let mut caps = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT cap_id, principal, operation, resource, risk_tier, expires_at, constraints, issued_at
                 FROM grants",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            })?;
            for row in rows {
                let (id, principal, operation, resource, tier, expires_at, constraints, issued_at) =
                    row?;
                let Some(risk_tier) = RiskTier::parse(&tier) else {
                    continue;
                };
                let constraints: Constraints =
                    serde_json::from_str(&constraints).unwrap_or_default();
                let cap = Capability {
                    revoked: revoked_ids.contains(&id),
                    id,
                    principal,
                    operation_pattern: operation,
                    resource_pattern: resource,
                    risk_tier,
                    expires_at,
                    constraints,
                    issued_at,
                };
                caps.push(compile_entry(cap)?);
            }
        }

        Ok(Self {
            caps: Mutex::new(caps),
            revoked_ids: Mutex::new(revoked_ids),
            conn: Mutex::new(conn),
            audit,
        })
    }

    /// Issue a capability. The grant is durable (re-emitted at startup);
    /// returns the new capability id.
    pub fn grant(
        &self,
        principal: &str,
        operation_pattern: &str,
        resource_pattern: &str,
        risk_tier: RiskTier,
        expires_at: Option<f64>,
        constraints: Constraints,
    ) -> Result<String, KernelError> {
        let cap = Capability {
            id: time::new_ulid(),
            principal: principal.to_string(),
            operation_pattern: operation_pattern.to_string(),
            resource_pattern: resource_pattern.to_string(),
            risk_tier,
            expires_at,
            constraints,
            revoked: false,
            issued_at: time::now_secs(),
        };
        let cap_id = cap.id.clone();
        let entry = compile_entry(cap)?;

        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| KernelError::Validation("grant store lock poisoned".to_string()))?;
            let constraints_json = serde_json::to_string(&entry.cap.constraints)
                .map_err(|e| KernelError::Validation(format!("constraints encode: {}", e)))?;
            conn.execute(
                "INSERT INTO grants(cap_id, principal, operation, resource, risk_tier, expires_at, constraints, issued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.cap.id,
                    entry.cap.principal,
                    entry.cap.operation_pattern,
                    entry.cap.resource_pattern,
                    entry.cap.risk_tier.as_str(),
                    entry.cap.expires_at,
                    constraints_json,
                    entry.cap.issued_at,
                ],
            )?;
        }

        self.audit.log(
            AuditDraft::new(principal, "cap.grant", AuditResult::Success)
                .object(&cap_id)
                .args(json!({
                    "operation": operation_pattern,
                    "resource": resource_pattern,
                    "tier": risk_tier.as_str(),
                    "expires_at": expires_at,
                }))
                .risk(risk_tier),
        )?;

        let mut caps = self
            .caps
            .lock()
            .map_err(|_| KernelError::Validation("capability lock poisoned".to_string()))?;
        caps.push(entry);
        Ok(cap_id)
    }

    /// Non-consuming authorization probe. Emits one audit entry.
    pub fn check(
        &self,
        principal: &str,
        op: &str,
        resource: &str,
        url: Option<&str>,
    ) -> Result<bool, KernelError> {
        match self.resolve(principal, op, resource, url, false) {
            Ok(tier) => {
                self.audit_decision(principal, op, resource, Ok(tier))?;
                Ok(true)
            }
            Err(reason) => {
                self.audit_decision(principal, op, resource, Err(reason))?;
                Ok(false)
            }
        }
    }

    /// Authorization gate. Consumes one rate token and one use of a
    /// single-use grant. Returns the matched capability's risk tier, or
    /// `CapabilityDenied` carrying the most specific miss reason.
    pub fn require(
        &self,
        principal: &str,
        op: &str,
        resource: &str,
        url: Option<&str>,
    ) -> Result<RiskTier, KernelError> {
        match self.resolve(principal, op, resource, url, true) {
            Ok(tier) => {
                self.audit_decision(principal, op, resource, Ok(tier))?;
                Ok(tier)
            }
            Err(reason) => {
                self.audit_decision(principal, op, resource, Err(reason))?;
                Err(KernelError::CapabilityDenied {
                    principal: principal.to_string(),
                    op: op.to_string(),
                    resource: resource.to_string(),
                    reason,
                })
            }
        }
    }

    /// Revoke one capability: durable tombstone first, then the in-memory
    /// flag. Never satisfiable again, even after restart.
    pub fn revoke(&self, cap_id: &str, reason: &str) -> Result<(), KernelError> {
        let principal = {
            let caps = self
                .caps
                .lock()
                .map_err(|_| KernelError::Validation("capability lock poisoned".to_string()))?;
            caps.iter()
                .find(|e| e.cap.id == cap_id)
                .map(|e| e.cap.principal.clone())
                .ok_or_else(|| KernelError::NotFound(format!("capability {}", cap_id)))?
        };
        self.write_tombstone(cap_id, &principal, reason)?;
        self.mark_revoked(|cap| cap.id == cap_id)?;
        self.audit.log(
            AuditDraft::new(&principal, "cap.revoke", AuditResult::Success)
                .object(cap_id)
                .args(json!({ "reason": reason })),
        )?;
        Ok(())
    }

    /// Revoke every capability held by `principal`.
    pub fn revoke_all(&self, principal: &str) -> Result<usize, KernelError> {
        let ids: Vec<String> = {
            let caps = self
                .caps
                .lock()
                .map_err(|_| KernelError::Validation("capability lock poisoned".to_string()))?;
            caps.iter()
                .filter(|e| e.cap.principal == principal && !e.cap.revoked)
                .map(|e| e.cap.id.clone())
                .collect()
        };
        for id in &ids {
            self.write_tombstone(id, principal, "revoke_all")?;
        }
        self.mark_revoked(|cap| cap.principal == principal)?;
        self.audit.log(
            AuditDraft::new(principal, "cap.revoke_all", AuditResult::Success)
                .args(json!({ "count": ids.len() })),
        )?;
        Ok(ids.len())
    }

    /// All capabilities issued to `principal` this process, tombstoned ones
    /// included.
    pub fn list(&self, principal: &str) -> Result<Vec<Capability>, KernelError> {
        let caps = self
            .caps
            .lock()
            .map_err(|_| KernelError::Validation("capability lock poisoned".to_string()))?;
        Ok(caps
            .iter()
            .filter(|e| e.cap.principal == principal)
            .map(|e| e.cap.clone())
            .collect())
    }

    fn resolve(
        &self,
        principal: &str,
        op: &str,
        resource: &str,
        url: Option<&str>,
        consume: bool,
    ) -> Result<RiskTier, DenyReason> {
        let now = time::now_secs();
        // Match under the capability lock; single-use accounting happens
        // after release (it takes the same lock again).
        let hit = {
            let caps = self.caps.lock().map_err(|_| DenyReason::NoGrant)?;
            let revoked_ids = self.revoked_ids.lock().map_err(|_| DenyReason::NoGrant)?;

            let mut best_miss = DenyReason::NoGrant;
            let mut found = None;
            for entry in caps.iter().filter(|e| e.cap.principal == principal) {
                if !entry.op_re.is_match(op) || !entry.res_re.is_match(resource) {
                    continue;
                }
                if entry.cap.revoked || revoked_ids.contains(&entry.cap.id) {
                    if DenyReason::Revoked.rank() > best_miss.rank() {
                        best_miss = DenyReason::Revoked;
                    }
                    continue;
                }
                if let Some(expires_at) = entry.cap.expires_at {
                    if now >= expires_at {
                        if DenyReason::Expired.rank() > best_miss.rank() {
                            best_miss = DenyReason::Expired;
                        }
                        continue;
                    }
                }
                if !self.constraints_hold(entry, url, now, consume) {
                    if DenyReason::ConstraintFailed.rank() > best_miss.rank() {
                        best_miss = DenyReason::ConstraintFailed;
                    }
                    continue;
                }
                let to_consume = (consume && entry.cap.constraints.uses_remaining.is_some())
                    .then(|| entry.cap.clone());
                found = Some((entry.cap.risk_tier, to_consume));
                break;
            }
            match found {
                Some(hit) => hit,
                None => return Err(best_miss),
            }
        };

        let (tier, to_consume) = hit;
        if let Some(cap) = to_consume {
            self.consume_use(&cap);
        }
        Ok(tier)
    }

    fn constraints_hold(&self, entry: &CapEntry, url: Option<&str>, now: f64, consume: bool) -> bool {
        if let Some(url_re) = &entry.url_re {
            match url {
                Some(url) if url_re.is_match(url) => {}
                _ => return false,
            }
        }
        if let Some(window) = &entry.cap.constraints.window {
            if !window.contains(time::secs_of_day(now)) {
                return false;
            }
        }
        if let Some(uses) = entry.cap.constraints.uses_remaining {
            if uses == 0 {
                return false;
            }
        }
        if let (Some(rate), Some(bucket)) = (&entry.cap.constraints.rate, &entry.bucket) {
            let Ok(mut state) = bucket.lock() else {
                return false;
            };
            let elapsed = (now - state.last_refill).max(0.0);
            state.tokens = (state.tokens + elapsed * rate.refill_per_sec).min(rate.capacity);
            state.last_refill = now;
            if state.tokens < 1.0 {
                return false;
            }
            if consume {
                state.tokens -= 1.0;
            }
        }
        true
    }

    /// Decrement a single-use grant; exhaustion tombstones it durably.
    fn consume_use(&self, cap: &Capability) {
        let Some(uses) = cap.constraints.uses_remaining else {
            return;
        };
        let remaining = uses.saturating_sub(1);
        let exhausted = remaining == 0;
        let mut constraints_json = None;
        if let Ok(mut caps) = self.caps.lock() {
            if let Some(entry) = caps.iter_mut().find(|e| e.cap.id == cap.id) {
                entry.cap.constraints.uses_remaining = Some(remaining);
                if exhausted {
                    entry.cap.revoked = true;
                }
                constraints_json = serde_json::to_string(&entry.cap.constraints).ok();
            }
        }
        if let Some(json) = constraints_json {
            if let Ok(conn) = self.conn.lock() {
                let _ = conn.execute(
                    "UPDATE grants SET constraints = ?1 WHERE cap_id = ?2",
                    params![json, cap.id],
                );
            }
        }
        if exhausted {
            let _ = self.write_tombstone(&cap.id, &cap.principal, "single_use_exhausted");
            if let Ok(mut ids) = self.revoked_ids.lock() {
                ids.insert(cap.id.clone());
            }
        }
    }

    fn audit_decision(
        &self,
        principal: &str,
        op: &str,
        resource: &str,
        outcome: Result<RiskTier, DenyReason>,
    ) -> Result<(), KernelError> {
        let draft = match outcome {
            Ok(tier) => AuditDraft::new(principal, op, AuditResult::Success)
                .object(resource)
                .args(json!({ "resource": resource, "decision": "allow" }))
                .provenance(Provenance::Agent)
                .risk(tier),
            Err(reason) => AuditDraft::new(principal, op, AuditResult::Denied)
                .object(resource)
                .args(json!({ "resource": resource, "decision": "deny" }))
                .provenance(Provenance::Agent)
                .error_kind(reason.as_str()),
        };
        self.audit.log(draft)?;
        Ok(())
    }

    fn write_tombstone(
        &self,
        cap_id: &str,
        principal: &str,
        reason: &str,
    ) -> Result<(), KernelError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| KernelError::Validation("revocation lock poisoned".to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO revocations(cap_id, principal, revoked_at, reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![cap_id, principal, time::now_secs(), reason],
        )?;
        Ok(())
    }

    fn mark_revoked<F: Fn(&Capability) -> bool>(&self, matches: F) -> Result<(), KernelError> {
        let mut caps = self
            .caps
            .lock()
            .map_err(|_| KernelError::Validation("capability lock poisoned".to_string()))?;
        let mut revoked_ids = self
            .revoked_ids
            .lock()
            .map_err(|_| KernelError::Validation("revocation lock poisoned".to_string()))?;
        for entry in caps.iter_mut().filter(|e| matches(&e.cap)) {
            entry.cap.revoked = true;
            revoked_ids.insert(entry.cap.id.clone());
        }
        Ok(())
    }
}

fn compile_entry(cap: Capability) -> Result<CapEntry, KernelError> {
    let op_re = pattern::op_glob(&cap.operation_pattern)
        .map_err(|e| KernelError::Validation(format!("bad operation pattern: {}", e)))?;
    let res_re = pattern::resource_glob(&cap.resource_pattern)
        .map_err(|e| KernelError::Validation(format!("bad resource pattern: {}", e)))?;
    let url_re = match &cap.constraints.url_glob {
        Some(glob) => Some(
            pattern::url_glob(glob)
                .map_err(|e| KernelError::Validation(format!("bad url glob: {}", e)))?,
        ),
        None => None,
    };
    let bucket = cap.constraints.rate.as_ref().map(|rate| {
        Mutex::new(BucketState {
            tokens: rate.capacity,
            last_refill: time::now_secs(),
        })
    });
    Ok(CapEntry {
        cap,
        op_re,
        res_re,
        url_re,
        bucket,
    })
}
