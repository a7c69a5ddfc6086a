//! Agent Runtime: code admission plus the mediated execution frame.
//!
//! A submission moves through three gates. Static admission parses the
//! source into an AST and refuses anything outside the vetted surface.
//! Dry-run inference executes the program with side effects stubbed to
//! collect the capability set it would need, for the governance
//! collaborator to approve. Execution then runs the program against the
//! live mediated surface under wall-clock, operation-count, and memory
//! budgets, with cancellation observed at every mediated call boundary.

pub mod admission;
pub mod interp;
pub mod program;
pub mod surface;

use crate::kernel::Kernel;
use crate::kernel::approval::Approver;
use crate::kernel::audit::AuditFilter;
use crate::kernel::config::KernelConfig;
use crate::kernel::error::KernelError;
use crate::kernel::renderer::Renderer;
use crate::kernel::time;
use crate::kernel::transaction::TxState;
use crate::runtime::interp::Interp;
use crate::runtime::program::{ValidationError, parse_program};
use crate::runtime::surface::{Mediator, Mode, RequiredCapability};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use uuid::Uuid;

/// Terminal state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Completed,
    Failed,
    TimedOut,
    BudgetExhausted,
}

impl ExecState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecState::Completed => "completed",
            ExecState::Failed => "failed",
            ExecState::TimedOut => "timed_out",
            ExecState::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// What a submission produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: ExecState,
    pub error: Option<String>,
    /// First and last audit entry ids written by this submission, for
    /// supervisor correlation.
    pub audit_range: (Option<Uuid>, Option<Uuid>),
    pub ops_used: u64,
}

/// The runtime binds the kernel's data plane, a renderer, and a governance
/// collaborator; all dependencies are explicit parameters.
pub struct AgentRuntime {
    kernel_audit: Arc<crate::kernel::audit::AuditLog>,
    objects: Arc<crate::kernel::object::ObjectManager>,
    broker: Arc<crate::kernel::capability::CapabilityBroker>,
    coordinator: Arc<crate::kernel::transaction::Coordinator>,
    renderer: Arc<dyn Renderer>,
    approver: Arc<dyn Approver>,
    config: KernelConfig,
}

impl AgentRuntime {
    pub fn new(kernel: &Kernel, renderer: Arc<dyn Renderer>, approver: Arc<dyn Approver>) -> Self {
        Self {
            kernel_audit: Arc::clone(&kernel.audit),
            objects: Arc::clone(&kernel.objects),
            broker: Arc::clone(&kernel.broker),
            coordinator: Arc::clone(&kernel.coordinator),
            renderer,
            approver,
            config: kernel.config.clone(),
        }
    }

    /// Static admission only: parse and walk, returning every violation.
    pub fn validate(&self, source: &str) -> Result<(), Vec<ValidationError>> {
        let program = parse_program(source)?;
        let errors = admission::admit(&program);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Execute with all side-effecting mediated calls stubbed, collecting
    /// the capability set the program would need.
    pub fn dry_run(
        &self,
        principal: &str,
        source: &str,
    ) -> Result<Vec<RequiredCapability>, Vec<ValidationError>> {
        let program = parse_program(source)?;
        let errors = admission::admit(&program);
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut mediator = self.mediator(principal, Arc::new(AtomicBool::new(false)), Mode::DryRun, &self.config);
        let mut interp = Interp::new(&mut mediator);
        if let Err(err) = interp.run(&program) {
            return Err(vec![ValidationError::new(
                "dry-run",
                "<execution>",
                err.to_string(),
            )]);
        }
        Ok(mediator.required)
    }

    /// Run a submission with the default config.
    pub fn submit(
        &self,
        principal: &str,
        source: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<ExecutionResult, Vec<ValidationError>> {
        self.submit_with(principal, source, cancel, &self.config)
    }

    /// Run a submission with per-submission limits.
    pub fn submit_with(
        &self,
        principal: &str,
        source: &str,
        cancel: Arc<AtomicBool>,
        config: &KernelConfig,
    ) -> Result<ExecutionResult, Vec<ValidationError>> {
        let program = parse_program(source)?;
        let errors = admission::admit(&program);
        if !errors.is_empty() {
            return Err(errors);
        }

        let started_at = time::now_secs();
        let mut mediator = self.mediator(principal, cancel, Mode::Live, config);
        let outcome = {
            let mut interp = Interp::new(&mut mediator);
            interp.run(&program)
        };

        // Belt over the interpreter's scope guards: nothing this submission
        // opened stays active past its end.
        let leftover: Vec<_> = mediator.tx_stack.drain(..).collect();
        for tx in leftover {
            if self.coordinator.state(tx) == Some(TxState::Active) {
                let _ = self.coordinator.abort(tx, "submission_end");
            }
        }

        let (state, error) = match outcome {
            Ok(()) => (ExecState::Completed, None),
            Err(err) => {
                let state = match &err {
                    KernelError::Timeout { .. } => ExecState::TimedOut,
                    KernelError::QuotaExceeded { .. } => ExecState::BudgetExhausted,
                    _ => ExecState::Failed,
                };
                (state, Some(err.to_string()))
            }
        };

        Ok(ExecutionResult {
            state,
            error,
            audit_range: self.audit_range(principal, started_at),
            ops_used: mediator.ops_used,
        })
    }

    fn mediator(
        &self,
        principal: &str,
        cancel: Arc<AtomicBool>,
        mode: Mode,
        config: &KernelConfig,
    ) -> Mediator {
        Mediator::new(
            Arc::clone(&self.kernel_audit),
            Arc::clone(&self.objects),
            Arc::clone(&self.broker),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.renderer),
            Arc::clone(&self.approver),
            principal,
            config,
            cancel,
            mode,
        )
    }

    fn audit_range(&self, principal: &str, since: f64) -> (Option<Uuid>, Option<Uuid>) {
        let entries = self
            .kernel_audit
            .query(&AuditFilter {
                principal: Some(principal.to_string()),
                since: Some(since),
                ..Default::default()
            })
            .unwrap_or_default();
        (
            entries.first().map(|e| e.id),
            entries.last().map(|e| e.id),
        )
    }
}
