//! Restricted execution frame for admitted programs.
//!
//! The interpreter binds exactly two things into agent code: the mediated
//! `browser.*` surface and a handful of pure helpers (`strings`, `math`,
//! `json`, `records`). Transaction blocks are scoped acquisitions: the
//! block's transaction commits only through an explicit `commit` statement,
//! and every other exit path, normal, error, or cancellation, aborts it.

use crate::kernel::error::KernelError;
use crate::kernel::provenance::Provenance;
use crate::kernel::transaction::TxState;
use crate::runtime::program::{CallExpr, Expr, Program, Stmt};
use crate::runtime::surface::{Mediator, Mode, Tainted};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, HashMap};

pub(crate) struct Interp<'m> {
    mediator: &'m mut Mediator,
    env: HashMap<String, Tainted>,
    /// Transaction blocks currently open, innermost last. Kept separate
    /// from the mediator's journal stack so terminal-state errors surface
    /// from the coordinator rather than being silently skipped.
    block_txs: Vec<crate::kernel::transaction::TxId>,
}

impl<'m> Interp<'m> {
    pub(crate) fn new(mediator: &'m mut Mediator) -> Self {
        Self {
            mediator,
            env: HashMap::new(),
            block_txs: Vec::new(),
        }
    }

    pub(crate) fn run(&mut self, program: &Program) -> Result<(), KernelError> {
        self.exec_block(&program.body)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), KernelError> {
        for stmt in stmts {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), KernelError> {
        match stmt {
            Stmt::Let { name, expr } => {
                let value = self.eval(expr)?;
                self.env.insert(name.clone(), value);
                Ok(())
            }
            Stmt::Call { call } => {
                self.eval_call(call)?;
                Ok(())
            }
            Stmt::Transaction { body } => self.exec_transaction(body),
            Stmt::Checkpoint { label } => {
                if self.mediator.mode == Mode::DryRun {
                    return Ok(());
                }
                let tx = self.current_tx("checkpoint")?;
                self.mediator.coordinator.checkpoint(tx, label)?;
                Ok(())
            }
            Stmt::Rollback { label } => {
                if self.mediator.mode == Mode::DryRun {
                    return Ok(());
                }
                let tx = self.current_tx("rollback")?;
                self.mediator.coordinator.rollback(tx, label.as_deref())?;
                Ok(())
            }
            Stmt::Commit => {
                if self.mediator.mode == Mode::DryRun {
                    return Ok(());
                }
                let tx = self.current_tx("commit")?;
                self.mediator.coordinator.commit(tx)?;
                self.mediator.tx_stack.retain(|t| *t != tx);
                Ok(())
            }
        }
    }

    fn exec_transaction(&mut self, body: &[Stmt]) -> Result<(), KernelError> {
        if self.mediator.mode == Mode::DryRun {
            // Dry-run collects capabilities; transactional bookkeeping is a
            // side effect the stubs skip.
            return self.exec_block(body);
        }
        let parent = self.block_txs.last().copied();
        let tx = self
            .mediator
            .coordinator
            .begin(&self.mediator.principal, parent)?;
        self.block_txs.push(tx);
        self.mediator.tx_stack.push(tx);

        let result = self.exec_block(body);

        self.block_txs.pop();
        self.mediator.tx_stack.retain(|t| *t != tx);

        match result {
            Ok(()) => {
                if self.mediator.coordinator.state(tx) == Some(TxState::Active) {
                    self.mediator.coordinator.abort(tx, "scope_exit")?;
                }
                Ok(())
            }
            Err(err) => {
                if self.mediator.coordinator.state(tx) == Some(TxState::Active) {
                    let _ = self.mediator.coordinator.abort(tx, err.kind_label());
                }
                Err(err)
            }
        }
    }

    fn current_tx(&self, stmt: &str) -> Result<crate::kernel::transaction::TxId, KernelError> {
        self.block_txs
            .last()
            .copied()
            .ok_or_else(|| KernelError::Validation(format!("{} outside a transaction", stmt)))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Tainted, KernelError> {
        match expr {
            Expr::Lit(value) => Ok(Tainted::agent(value.clone())),
            Expr::Var { var } => self
                .env
                .get(var)
                .cloned()
                .ok_or_else(|| KernelError::Validation(format!("unbound variable '{}'", var))),
            Expr::Call(call) => self.eval_call(call),
        }
    }

    fn eval_call(&mut self, call: &CallExpr) -> Result<Tainted, KernelError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval(arg)?);
        }
        let mut kwargs = BTreeMap::new();
        for (key, value) in &call.kwargs {
            kwargs.insert(key.clone(), self.eval(value)?);
        }

        match call.target.strip_prefix("browser.") {
            Some(op) => self.mediator.invoke(op, &args, &kwargs),
            None => pure_call(&call.target, &args, &kwargs),
        }
    }
}

/// Pure stdlib helpers. Never privileged, never audited; taint simply
/// propagates through.
fn pure_call(
    target: &str,
    args: &[Tainted],
    kwargs: &BTreeMap<String, Tainted>,
) -> Result<Tainted, KernelError> {
    let taint = args
        .iter()
        .map(|a| a.provenance)
        .chain(kwargs.values().map(|a| a.provenance))
        .fold(Provenance::Agent, Provenance::combine);

    let value = match target {
        "strings.concat" => {
            let mut out = String::new();
            for arg in args {
                match &arg.value {
                    JsonValue::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            json!(out)
        }
        "strings.upper" => json!(str_arg(args, 0, target)?.to_uppercase()),
        "strings.lower" => json!(str_arg(args, 0, target)?.to_lowercase()),
        "math.add" => json!(num_arg(args, 0, target)? + num_arg(args, 1, target)?),
        "math.sub" => json!(num_arg(args, 0, target)? - num_arg(args, 1, target)?),
        "math.mul" => json!(num_arg(args, 0, target)? * num_arg(args, 1, target)?),
        "json.get" => {
            let key = str_arg(args, 1, target)?;
            args.first()
                .and_then(|a| a.value.get(key))
                .cloned()
                .unwrap_or(JsonValue::Null)
        }
        "records.make" => {
            let mut out = serde_json::Map::new();
            for (key, value) in kwargs {
                out.insert(key.clone(), value.value.clone());
            }
            JsonValue::Object(out)
        }
        other => {
            return Err(KernelError::Validation(format!(
                "unknown helper '{}'",
                other
            )));
        }
    };
    Ok(Tainted { value, provenance: taint })
}

fn str_arg<'a>(args: &'a [Tainted], index: usize, target: &str) -> Result<&'a str, KernelError> {
    args.get(index)
        .and_then(|a| a.value.as_str())
        .ok_or_else(|| KernelError::Validation(format!("{}: expected string argument", target)))
}

fn num_arg(args: &[Tainted], index: usize, target: &str) -> Result<f64, KernelError> {
    args.get(index)
        .and_then(|a| a.value.as_f64())
        .ok_or_else(|| KernelError::Validation(format!("{}: expected numeric argument", target)))
}
