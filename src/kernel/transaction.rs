//! Transaction Coordinator: checkpoints, hybrid snapshots, rollback.
//!
//! Transactions journal pre-images lazily: the first touch of an object in
//! the current frame records the displaced version, so a checkpoint seals
//! exactly the set of objects touched since the previous checkpoint.
//! Small pre-images are copied by value; large ones are referenced through
//! the object manager's version ring, which keeps a 5 MB snapshot at
//! near-zero marginal memory and constant time.
//!
//! Nested transactions keep independent frame chains. A child commit folds
//! its journal into the parent's open frame, so a later parent rollback
//! still crosses the child's effects (child checkpoint labels do not leak
//! into the parent's namespace). A child abort undoes only its own frames.
//!
//! Irreversible (T3) operations gate on the commit boundary: at most one
//! per transaction, and success forces the whole enclosing chain to commit.
//! Any rollback attempted across that commit fails.

use crate::kernel::audit::{AuditDraft, AuditLog, AuditResult};
use crate::kernel::error::KernelError;
use crate::kernel::object::{Attrs, Displaced, ObjectId, ObjectManager};
use crate::kernel::time;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transaction identifier, rendered as `tx:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Checkpoint identifier, rendered as `cp:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpId(pub u64);

impl fmt::Display for CpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

impl TxState {
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }
}

/// Journaled pre-image for one touched object.
enum PreImage {
    /// Small payload copied by value at touch time.
    Value(Attrs),
    /// Large payload referenced into the version ring.
    Shared(Arc<Attrs>),
    /// Object created in this frame; undo removes it.
    Created,
    /// Object disposed in this frame; undo restores it.
    Disposed(Arc<Attrs>),
}

/// How a mediated operation touched an object.
pub enum Touch {
    Mutated(Displaced),
    Created,
    Disposed(Displaced),
}

struct JournalRecord {
    id: ObjectId,
    pre: PreImage,
}

struct Frame {
    label: Option<String>,
    cp_id: Option<CpId>,
    records: Vec<JournalRecord>,
    touched: FxHashSet<ObjectId>,
    created_at: f64,
}

impl Frame {
    fn open() -> Self {
        Self {
            label: None,
            cp_id: None,
            records: Vec::new(),
            touched: FxHashSet::default(),
            created_at: time::now_secs(),
        }
    }
}

struct TxRecord {
    id: TxId,
    principal: String,
    state: TxState,
    parent: Option<TxId>,
    children: Vec<TxId>,
    sealed: Vec<Frame>,
    open: Frame,
    ops: Vec<String>,
    t3_pending: bool,
    t3_committed: bool,
}

/// Read-only summary of a transaction.
#[derive(Debug, Clone)]
pub struct TxView {
    pub id: TxId,
    pub principal: String,
    pub state: TxState,
    pub parent: Option<TxId>,
    pub ops: Vec<String>,
    pub checkpoints: Vec<CheckpointView>,
}

#[derive(Debug, Clone)]
pub struct CheckpointView {
    pub label: String,
    pub id: CpId,
    pub created_at: f64,
}

/// Coordinator over all transactions in the process. Terminal records are
/// retained for the process lifetime so post-commit rollback attempts can
/// be answered precisely; nothing here survives restart (active
/// transactions at shutdown are forcibly aborted).
pub struct Coordinator {
    txs: Mutex<FxHashMap<u64, TxRecord>>,
    active_top: Mutex<FxHashMap<String, TxId>>,
    tx_counter: AtomicU64,
    cp_counter: AtomicU64,
    objects: Arc<ObjectManager>,
    audit: Arc<AuditLog>,
    copy_max: usize,
}

impl Coordinator {
    pub fn new(objects: Arc<ObjectManager>, audit: Arc<AuditLog>, copy_max: usize) -> Self {
        Self {
            txs: Mutex::new(FxHashMap::default()),
            active_top: Mutex::new(FxHashMap::default()),
            tx_counter: AtomicU64::new(1),
            cp_counter: AtomicU64::new(1),
            objects,
            audit,
            copy_max,
        }
    }

    /// Start a transaction. Top-level transactions are limited to one
    /// active per principal; nesting requires an active parent.
    pub fn begin(&self, principal: &str, parent: Option<TxId>) -> Result<TxId, KernelError> {
        let id = TxId(self.tx_counter.fetch_add(1, Ordering::SeqCst));
        {
            let mut txs = self.lock_txs()?;
            if let Some(parent_id) = parent {
                let parent_rec = txs
                    .get_mut(&parent_id.0)
                    .ok_or_else(|| KernelError::NotFound(format!("transaction {}", parent_id)))?;
                if parent_rec.state != TxState::Active {
                    return Err(KernelError::TransactionClosed {
                        tx_id: parent_id.to_string(),
                        state: parent_rec.state.as_str().to_string(),
                    });
                }
                parent_rec.children.push(id);
            } else {
                let mut active_top = self.lock_active()?;
                if active_top.contains_key(principal) {
                    return Err(KernelError::Validation(format!(
                        "principal {} already has an active top-level transaction",
                        principal
                    )));
                }
                active_top.insert(principal.to_string(), id);
            }
            txs.insert(
                id.0,
                TxRecord {
                    id,
                    principal: principal.to_string(),
                    state: TxState::Active,
                    parent,
                    children: Vec::new(),
                    sealed: Vec::new(),
                    open: Frame::open(),
                    ops: Vec::new(),
                    t3_pending: false,
                    t3_committed: false,
                },
            );
        }
        self.audit.log(
            AuditDraft::new(principal, "tx.begin", AuditResult::Success)
                .object(&id.to_string())
                .args(json!({ "parent": parent.map(|p| p.to_string()) }))
                .tx(Some(id.to_string()), None),
        )?;
        Ok(id)
    }

    /// Journal a touch into the transaction's open frame. First touch per
    /// frame wins; later touches of the same object are already covered.
    pub fn record_touch(&self, tx: TxId, id: ObjectId, touch: Touch) -> Result<(), KernelError> {
        let mut txs = self.lock_txs()?;
        let rec = self.active_mut(&mut txs, tx)?;
        rec.ops.push(format!("touch:{}", id));
        if rec.open.touched.contains(&id) {
            return Ok(());
        }
        rec.open.touched.insert(id);
        let pre = match touch {
            Touch::Created => PreImage::Created,
            Touch::Disposed(displaced) => PreImage::Disposed(displaced.attrs),
            Touch::Mutated(displaced) => {
                if displaced.serialized_len <= self.copy_max {
                    PreImage::Value((*displaced.attrs).clone())
                } else {
                    PreImage::Shared(displaced.attrs)
                }
            }
        };
        rec.open.records.push(JournalRecord { id, pre });
        Ok(())
    }

    /// Record a mediated operation name in the transaction's op sequence.
    pub fn record_op(&self, tx: TxId, op: &str) -> Result<(), KernelError> {
        let mut txs = self.lock_txs()?;
        let rec = self.active_mut(&mut txs, tx)?;
        rec.ops.push(op.to_string());
        Ok(())
    }

    /// Seal the open frame under `label`. Labels are unique within a
    /// transaction.
    pub fn checkpoint(&self, tx: TxId, label: &str) -> Result<CpId, KernelError> {
        let (cp_id, principal) = {
            let mut txs = self.lock_txs()?;
            let rec = self.active_mut(&mut txs, tx)?;
            if rec
                .sealed
                .iter()
                .any(|f| f.label.as_deref() == Some(label))
            {
                return Err(KernelError::Validation(format!(
                    "checkpoint label '{}' already used in {}",
                    label, tx
                )));
            }
            let cp_id = CpId(self.cp_counter.fetch_add(1, Ordering::SeqCst));
            let mut frame = std::mem::replace(&mut rec.open, Frame::open());
            frame.label = Some(label.to_string());
            frame.cp_id = Some(cp_id);
            frame.created_at = time::now_secs();
            rec.sealed.push(frame);
            (cp_id, rec.principal.clone())
        };
        self.audit.log(
            AuditDraft::new(&principal, "tx.checkpoint", AuditResult::Success)
                .object(&cp_id.to_string())
                .args(json!({ "label": label }))
                .tx(Some(tx.to_string()), Some(cp_id.to_string())),
        )?;
        Ok(cp_id)
    }

    /// Roll back to a named checkpoint, or to transaction start when no
    /// label is given. The transaction stays active.
    pub fn rollback(&self, tx: TxId, label: Option<&str>) -> Result<(), KernelError> {
        let (principal, open, undone) = {
            let mut txs = self.lock_txs()?;
            let rec = txs
                .get_mut(&tx.0)
                .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
            if rec.t3_committed {
                return Err(KernelError::IrreversibleOperation {
                    op: "tx.rollback".to_string(),
                    tx_id: tx.to_string(),
                });
            }
            if rec.state != TxState::Active {
                return Err(KernelError::TransactionClosed {
                    tx_id: tx.to_string(),
                    state: rec.state.as_str().to_string(),
                });
            }

            let keep = match label {
                None => 0,
                Some(label) => {
                    let idx = rec
                        .sealed
                        .iter()
                        .position(|f| f.label.as_deref() == Some(label))
                        .ok_or_else(|| {
                            KernelError::NotFound(format!("checkpoint '{}' in {}", label, tx))
                        })?;
                    idx + 1
                }
            };

            let open = std::mem::replace(&mut rec.open, Frame::open());
            let undone: Vec<Frame> = rec.sealed.split_off(keep);
            (rec.principal.clone(), open, undone)
        };
        self.undo_frame(open)?;
        for frame in undone.into_iter().rev() {
            self.undo_frame(frame)?;
        }
        self.audit.log(
            AuditDraft::new(&principal, "tx.rollback", AuditResult::Success)
                .args(json!({ "to": label }))
                .tx(Some(tx.to_string()), None),
        )?;
        Ok(())
    }

    /// Commit. A nested commit folds the child's journal into the parent's
    /// open frame so parent-level rollback still crosses it; only the
    /// outermost commit makes effects final.
    pub fn commit(&self, tx: TxId) -> Result<(), KernelError> {
        let principal = {
            let mut txs = self.lock_txs()?;
            {
                let rec = txs
                    .get(&tx.0)
                    .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
                if rec.state != TxState::Active {
                    return Err(KernelError::TransactionClosed {
                        tx_id: tx.to_string(),
                        state: rec.state.as_str().to_string(),
                    });
                }
                let has_active_child = rec
                    .children
                    .iter()
                    .any(|c| txs.get(&c.0).map(|r| r.state) == Some(TxState::Active));
                if has_active_child {
                    return Err(KernelError::Validation(format!(
                        "transaction {} has an active child",
                        tx
                    )));
                }
            }
            let rec = txs
                .get_mut(&tx.0)
                .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
            rec.state = TxState::Committed;
            let principal = rec.principal.clone();
            let parent = rec.parent;
            let mut frames = std::mem::take(&mut rec.sealed);
            frames.push(std::mem::replace(&mut rec.open, Frame::open()));

            match parent {
                Some(parent_id) => {
                    let parent_rec = txs
                        .get_mut(&parent_id.0)
                        .ok_or_else(|| KernelError::NotFound(format!("transaction {}", parent_id)))?;
                    for frame in frames {
                        for record in frame.records {
                            // Parent-level first-touch still wins on undo:
                            // records replay newest-first, so an earlier
                            // parent pre-image overwrites this one.
                            parent_rec.open.touched.insert(record.id);
                            parent_rec.open.records.push(record);
                        }
                    }
                }
                None => {
                    let mut active_top = self.lock_active()?;
                    if active_top.get(&principal) == Some(&tx) {
                        active_top.remove(&principal);
                    }
                }
            }
            principal
        };
        self.audit.log(
            AuditDraft::new(&principal, "tx.commit", AuditResult::Success)
                .tx(Some(tx.to_string()), None),
        )?;
        Ok(())
    }

    /// Abort: undo this transaction's effects only (children first), then
    /// mark terminal.
    pub fn abort(&self, tx: TxId, reason: &str) -> Result<(), KernelError> {
        let children = {
            let txs = self.lock_txs()?;
            let rec = txs
                .get(&tx.0)
                .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
            if rec.state != TxState::Active {
                return Err(KernelError::TransactionClosed {
                    tx_id: tx.to_string(),
                    state: rec.state.as_str().to_string(),
                });
            }
            rec.children.clone()
        };
        for child in children {
            if self.state(child) == Some(TxState::Active) {
                self.abort(child, reason)?;
            }
        }

        let (principal, open, sealed, top_level) = {
            let mut txs = self.lock_txs()?;
            let rec = txs
                .get_mut(&tx.0)
                .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
            rec.state = TxState::Aborted;
            (
                rec.principal.clone(),
                std::mem::replace(&mut rec.open, Frame::open()),
                std::mem::take(&mut rec.sealed),
                rec.parent.is_none(),
            )
        };

        self.undo_frame(open)?;
        for frame in sealed.into_iter().rev() {
            self.undo_frame(frame)?;
        }
        if top_level {
            let mut active_top = self.lock_active()?;
            if active_top.get(&principal) == Some(&tx) {
                active_top.remove(&principal);
            }
        }
        self.audit.log(
            AuditDraft::new(&principal, "tx.abort", AuditResult::Success)
                .args(json!({ "reason": reason }))
                .tx(Some(tx.to_string()), None),
        )?;
        Ok(())
    }

    /// Admit a T3 operation: at most one uncommitted T3 per transaction
    /// chain.
    pub fn t3_admit(&self, tx: TxId, op: &str) -> Result<(), KernelError> {
        let mut txs = self.lock_txs()?;
        let mut cursor = Some(tx);
        while let Some(id) = cursor {
            let rec = txs
                .get(&id.0)
                .ok_or_else(|| KernelError::NotFound(format!("transaction {}", id)))?;
            if rec.t3_pending || rec.t3_committed {
                return Err(KernelError::IrreversibleOperation {
                    op: op.to_string(),
                    tx_id: id.to_string(),
                });
            }
            cursor = rec.parent;
        }
        let rec = self.active_mut(&mut txs, tx)?;
        rec.t3_pending = true;
        Ok(())
    }

    /// Resolve a T3 boundary. Success forces commit of the whole enclosing
    /// chain and pins it against rollback; failure releases the admission.
    pub fn t3_complete(&self, tx: TxId, success: bool) -> Result<(), KernelError> {
        let chain = {
            let mut txs = self.lock_txs()?;
            let mut chain = Vec::new();
            let mut cursor = Some(tx);
            while let Some(id) = cursor {
                let rec = txs
                    .get_mut(&id.0)
                    .ok_or_else(|| KernelError::NotFound(format!("transaction {}", id)))?;
                if success {
                    rec.t3_committed = true;
                } else if id == tx {
                    rec.t3_pending = false;
                }
                cursor = rec.parent;
                chain.push(id);
            }
            chain
        };
        if success {
            for id in chain {
                self.commit(id)?;
            }
        }
        Ok(())
    }

    pub fn state(&self, tx: TxId) -> Option<TxState> {
        let txs = self.txs.lock().ok()?;
        txs.get(&tx.0).map(|rec| rec.state)
    }

    pub fn view(&self, tx: TxId) -> Option<TxView> {
        let txs = self.txs.lock().ok()?;
        txs.get(&tx.0).map(|rec| TxView {
            id: rec.id,
            principal: rec.principal.clone(),
            state: rec.state,
            parent: rec.parent,
            ops: rec.ops.clone(),
            checkpoints: rec
                .sealed
                .iter()
                .filter_map(|f| {
                    Some(CheckpointView {
                        label: f.label.clone()?,
                        id: f.cp_id?,
                        created_at: f.created_at,
                    })
                })
                .collect(),
        })
    }

    pub fn active_for(&self, principal: &str) -> Option<TxId> {
        let active_top = self.active_top.lock().ok()?;
        active_top.get(principal).copied()
    }

    /// Forcibly abort every active transaction (process shutdown path).
    pub fn shutdown(&self) -> Result<(), KernelError> {
        let tops: Vec<TxId> = {
            let active_top = self.lock_active()?;
            active_top.values().copied().collect()
        };
        for tx in tops {
            if self.state(tx) == Some(TxState::Active) {
                self.abort(tx, "shutdown")?;
            }
        }
        Ok(())
    }

    fn undo_frame(&self, frame: Frame) -> Result<(), KernelError> {
        for record in frame.records.into_iter().rev() {
            match record.pre {
                PreImage::Value(attrs) => self.objects.restore(record.id, Arc::new(attrs))?,
                PreImage::Shared(attrs) => self.objects.restore(record.id, attrs)?,
                PreImage::Created => self.objects.remove(record.id)?,
                PreImage::Disposed(attrs) => self.objects.restore(record.id, attrs)?,
            }
        }
        Ok(())
    }

    fn lock_txs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FxHashMap<u64, TxRecord>>, KernelError> {
        self.txs
            .lock()
            .map_err(|_| KernelError::Validation("transaction lock poisoned".to_string()))
    }

    fn lock_active(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FxHashMap<String, TxId>>, KernelError> {
        self.active_top
            .lock()
            .map_err(|_| KernelError::Validation("transaction lock poisoned".to_string()))
    }

    fn active_mut<'a>(
        &self,
        txs: &'a mut FxHashMap<u64, TxRecord>,
        tx: TxId,
    ) -> Result<&'a mut TxRecord, KernelError> {
        let rec = txs
            .get_mut(&tx.0)
            .ok_or_else(|| KernelError::NotFound(format!("transaction {}", tx)))?;
        if rec.state != TxState::Active {
            return Err(KernelError::TransactionClosed {
                tx_id: tx.to_string(),
                state: rec.state.as_str().to_string(),
            });
        }
        Ok(rec)
    }
}

/// Scope guard for the mediated `transaction()` surface: commit happens
/// only through an explicit `commit()`; every other exit path (normal,
/// error, cancellation) aborts.
pub struct TxScope<'a> {
    coordinator: &'a Coordinator,
    tx: TxId,
    resolved: bool,
}

impl<'a> TxScope<'a> {
    pub fn new(coordinator: &'a Coordinator, tx: TxId) -> Self {
        Self {
            coordinator,
            tx,
            resolved: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.tx
    }

    pub fn commit(mut self) -> Result<(), KernelError> {
        self.resolved = true;
        self.coordinator.commit(self.tx)
    }

    pub fn abort(mut self, reason: &str) -> Result<(), KernelError> {
        self.resolved = true;
        self.coordinator.abort(self.tx, reason)
    }

    /// Mark resolved without acting (the coordinator already closed the
    /// transaction, e.g. at a T3 commit boundary).
    pub fn disarm(&mut self) {
        self.resolved = true;
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.coordinator.state(self.tx) == Some(TxState::Active) {
            let _ = self.coordinator.abort(self.tx, "scope_exit");
        }
    }
}
