//! Mediated `browser.*` surface.
//!
//! A single mediation wrapper fronts every exposed operation; it is the
//! only path to the capability broker and the audit log. Per call, in
//! order: boundary checks (cancellation, deadline, budgets), the
//! capability firewall (taint on T3 arguments), the commit-boundary gate,
//! `Broker::require`, the operation itself with pre-image journaling into
//! the innermost transaction, then exactly one audit entry for the
//! mutation. No lock is held across the renderer boundary.

use crate::kernel::audit::{AuditDraft, AuditLog, AuditResult};
use crate::kernel::capability::{CapabilityBroker, Constraints, RiskTier};
use crate::kernel::approval::{ApprovalDecision, Approver};
use crate::kernel::config::KernelConfig;
use crate::kernel::error::KernelError;
use crate::kernel::object::{Attrs, ObjectId, ObjectKind, ObjectManager};
use crate::kernel::provenance::Provenance;
use crate::kernel::renderer::{ExtractKind, LoadState, Renderer};
use crate::kernel::time;
use crate::kernel::transaction::{Coordinator, Touch, TxId, TxState};
use crate::runtime::admission::FORM_KINDS;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// A runtime value with its propagated origin tag.
#[derive(Debug, Clone)]
pub struct Tainted {
    pub value: JsonValue,
    pub provenance: Provenance,
}

impl Tainted {
    pub fn system(value: JsonValue) -> Self {
        Self {
            value,
            provenance: Provenance::System,
        }
    }

    pub fn agent(value: JsonValue) -> Self {
        Self {
            value,
            provenance: Provenance::Agent,
        }
    }

    pub fn web(value: JsonValue) -> Self {
        Self {
            value,
            provenance: Provenance::WebContent,
        }
    }
}

/// One mediated operation: name and risk tier.
pub struct OpSpec {
    pub name: &'static str,
    pub tier: RiskTier,
}

/// The finite, capability-gated surface bound into agent code.
pub const SURFACE: &[OpSpec] = &[
    OpSpec { name: "tab.open", tier: RiskTier::T2Stateful },
    OpSpec { name: "tab.navigate", tier: RiskTier::T2Stateful },
    OpSpec { name: "tab.wait_for", tier: RiskTier::T1Read },
    OpSpec { name: "tab.extract", tier: RiskTier::T1Read },
    OpSpec { name: "tab.close", tier: RiskTier::T2Stateful },
    OpSpec { name: "form.find", tier: RiskTier::T1Read },
    OpSpec { name: "form.fill", tier: RiskTier::T2Stateful },
    OpSpec { name: "form.submit", tier: RiskTier::T3Irreversible },
    OpSpec { name: "workspace.create", tier: RiskTier::T2Stateful },
    OpSpec { name: "workspace.attach", tier: RiskTier::T2Stateful },
    OpSpec { name: "credential.use", tier: RiskTier::T3Irreversible },
    OpSpec { name: "human.approve", tier: RiskTier::T1Read },
    OpSpec { name: "audit.query", tier: RiskTier::T1Read },
];

pub fn op_tier(op: &str) -> Option<RiskTier> {
    SURFACE.iter().find(|spec| spec.name == op).map(|s| s.tier)
}

/// Capability an operation would need, collected during dry-run inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredCapability {
    pub op: String,
    pub resource: String,
    pub tier: RiskTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Live,
    DryRun,
}

/// Per-submission mediation context.
pub(crate) struct Mediator {
    pub audit: Arc<AuditLog>,
    pub objects: Arc<ObjectManager>,
    pub broker: Arc<CapabilityBroker>,
    pub coordinator: Arc<Coordinator>,
    pub renderer: Arc<dyn Renderer>,
    pub approver: Arc<dyn Approver>,
    pub principal: String,
    pub cancel: Arc<AtomicBool>,
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub op_budget: u64,
    pub ops_used: u64,
    pub memory_budget: u64,
    pub memory_used: u64,
    pub renderer_retries: u32,
    pub renderer_backoff_ms: u64,
    pub tx_stack: Vec<TxId>,
    pub mode: Mode,
    pub required: Vec<RequiredCapability>,
}

impl Mediator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        audit: Arc<AuditLog>,
        objects: Arc<ObjectManager>,
        broker: Arc<CapabilityBroker>,
        coordinator: Arc<Coordinator>,
        renderer: Arc<dyn Renderer>,
        approver: Arc<dyn Approver>,
        principal: &str,
        config: &KernelConfig,
        cancel: Arc<AtomicBool>,
        mode: Mode,
    ) -> Self {
        Self {
            audit,
            objects,
            broker,
            coordinator,
            renderer,
            approver,
            principal: principal.to_string(),
            cancel,
            deadline: Instant::now() + std::time::Duration::from_millis(config.timeout_ms),
            timeout_ms: config.timeout_ms,
            op_budget: config.op_budget,
            ops_used: 0,
            memory_budget: config.memory_budget_bytes,
            memory_used: 0,
            renderer_retries: config.renderer_retries,
            renderer_backoff_ms: config.renderer_backoff_ms,
            tx_stack: Vec::new(),
            mode,
            required: Vec::new(),
        }
    }

    pub(crate) fn innermost_tx(&self) -> Option<TxId> {
        self.tx_stack.last().copied()
    }

    /// Drop transactions the coordinator already closed (T3 commit
    /// boundaries cascade commits without the interpreter's help).
    pub(crate) fn prune_closed_txs(&mut self) {
        let coordinator = Arc::clone(&self.coordinator);
        self.tx_stack
            .retain(|tx| coordinator.state(*tx) == Some(TxState::Active));
    }

    /// Dispatch one mediated call.
    pub(crate) fn invoke(
        &mut self,
        op: &str,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        self.boundary_check(op)?;
        let tier = op_tier(op)
            .ok_or_else(|| KernelError::Validation(format!("unknown mediated operation '{}'", op)))?;

        let taint = args
            .iter()
            .map(|a| a.provenance)
            .chain(kwargs.values().map(|a| a.provenance))
            .fold(Provenance::System, Provenance::combine);

        if tier == RiskTier::T3Irreversible && taint == Provenance::WebContent {
            self.audit_error(op, None, "firewall", AuditResult::Denied, taint)?;
            return Err(KernelError::Security {
                rule: "t3-web-content".to_string(),
                op: op.to_string(),
                provenance: taint,
            });
        }

        if self.mode == Mode::DryRun {
            return self.dry_run_stub(op, tier);
        }

        if let Some(tx) = self.innermost_tx() {
            self.coordinator.record_op(tx, op)?;
        }
        let result = self.dispatch(op, tier, taint, args, kwargs);
        if let Ok(value) = &result {
            self.memory_used += value.value.to_string().len() as u64;
            if self.memory_used > self.memory_budget {
                self.audit_error(op, None, "quota_exceeded", AuditResult::Error, taint)?;
                return Err(KernelError::QuotaExceeded {
                    kind: "memory".to_string(),
                });
            }
        }
        result
    }

    fn boundary_check(&mut self, op: &str) -> Result<(), KernelError> {
        if self.cancel.load(Ordering::SeqCst) {
            self.audit_error(op, None, "cancelled", AuditResult::Error, Provenance::System)?;
            return Err(KernelError::Cancelled { op: op.to_string() });
        }
        if Instant::now() >= self.deadline {
            self.audit_error(op, None, "timeout", AuditResult::Error, Provenance::System)?;
            return Err(KernelError::Timeout {
                op: op.to_string(),
                budget_ms: self.timeout_ms,
            });
        }
        if self.ops_used >= self.op_budget {
            self.audit_error(op, None, "quota_exceeded", AuditResult::Error, Provenance::System)?;
            return Err(KernelError::QuotaExceeded {
                kind: "operations".to_string(),
            });
        }
        self.ops_used += 1;
        Ok(())
    }

    fn dry_run_stub(&mut self, op: &str, tier: RiskTier) -> Result<Tainted, KernelError> {
        let required = RequiredCapability {
            op: op.to_string(),
            resource: generic_resource(op).to_string(),
            tier,
        };
        if !self.required.contains(&required) {
            self.required.push(required);
        }
        Ok(match op {
            "tab.open" => Tainted::system(json!("tab:0")),
            "form.find" => Tainted::system(json!("form:0")),
            "workspace.create" => Tainted::system(json!("workspace:0")),
            "tab.extract" => Tainted::web(json!({ "stub": true })),
            "credential.use" => Tainted::system(json!("bearer:stub")),
            "audit.query" => Tainted::system(json!([])),
            _ => Tainted::system(json!(true)),
        })
    }

    fn dispatch(
        &mut self,
        op: &str,
        tier: RiskTier,
        taint: Provenance,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        match op {
            "tab.open" => self.tab_open(taint, args, kwargs),
            "tab.navigate" => self.tab_navigate(taint, args),
            "tab.wait_for" => self.tab_wait_for(taint, args),
            "tab.extract" => self.tab_extract(taint, args),
            "tab.close" => self.tab_close(taint, args),
            "form.find" => self.form_find(taint, args, kwargs),
            "form.fill" => self.form_fill(taint, args),
            "form.submit" => self.form_submit(taint, args, kwargs),
            "workspace.create" => self.workspace_create(taint, args),
            "workspace.attach" => self.workspace_attach(taint, args),
            "credential.use" => self.credential_use(taint, args),
            "human.approve" => self.human_approve(args, kwargs),
            "audit.query" => self.audit_query(kwargs),
            other => Err(KernelError::Validation(format!(
                "unknown mediated operation '{}'",
                other
            ))),
        }
        .inspect(|_| {
            if tier == RiskTier::T3Irreversible {
                self.prune_closed_txs();
            }
        })
    }

    // --- tab ---

    fn tab_open(
        &mut self,
        taint: Provenance,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        let url = arg_str(args, 0, "tab.open", "url")?.to_string();
        let workspace = kwargs
            .get("workspace")
            .map(|w| parse_id(&w.value, ObjectKind::Workspace))
            .transpose()?;

        self.broker
            .require(&self.principal, "tab.open", "tab:*", Some(&url))?;

        let mut attrs = Attrs::new();
        attrs.insert("url".to_string(), json!(url));
        attrs.insert("title".to_string(), json!(""));
        attrs.insert("load_state".to_string(), json!(LoadState::Loading.as_str()));
        attrs.insert(
            "workspace_id".to_string(),
            workspace.map(|w| json!(w.to_string())).unwrap_or(JsonValue::Null),
        );
        attrs.insert("created_at".to_string(), json!(time::now_secs()));
        let tab = self.objects.create(ObjectKind::Tab, attrs)?;
        self.journal(tab, Touch::Created)?;

        let load_state = self.navigate_with_retry(tab, &url)?;
        let mut patch = Attrs::new();
        patch.insert("load_state".to_string(), json!(load_state.as_str()));
        let displaced = self.objects.update(tab, patch, None)?;
        self.journal(tab, Touch::Mutated(displaced))?;

        if let Some(workspace) = workspace {
            self.attach_tab_to_workspace(workspace, tab)?;
        }

        self.audit_ok(
            "tab.open",
            Some(&tab.to_string()),
            json!({ "url": url, "workspace": workspace.map(|w| w.to_string()) }),
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(tab.to_string())))
    }

    fn tab_navigate(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let tab = arg_id(args, 0, "tab.navigate", ObjectKind::Tab)?;
        let url = arg_str(args, 1, "tab.navigate", "url")?.to_string();

        self.broker
            .require(&self.principal, "tab.navigate", &tab.to_string(), Some(&url))?;
        self.objects
            .get(tab)
            .ok_or_else(|| KernelError::ObjectNotFound { id: tab.to_string() })?;

        let load_state = self.navigate_with_retry(tab, &url)?;
        let mut patch = Attrs::new();
        patch.insert("url".to_string(), json!(url));
        patch.insert("load_state".to_string(), json!(load_state.as_str()));
        let displaced = self.objects.update(tab, patch, None)?;
        self.journal(tab, Touch::Mutated(displaced))?;

        self.audit_ok(
            "tab.navigate",
            Some(&tab.to_string()),
            json!({ "url": url, "load_state": load_state.as_str() }),
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(load_state.as_str())))
    }

    fn tab_wait_for(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let tab = arg_id(args, 0, "tab.wait_for", ObjectKind::Tab)?;
        let want = arg_str(args, 1, "tab.wait_for", "state")?;
        let want = LoadState::parse(want)
            .ok_or_else(|| KernelError::Validation(format!("unknown load state '{}'", want)))?;

        self.broker
            .require(&self.principal, "tab.wait_for", &tab.to_string(), None)?;
        let view = self
            .objects
            .get(tab)
            .ok_or_else(|| KernelError::ObjectNotFound { id: tab.to_string() })?;
        let reached = view.str_attr("load_state") == Some(want.as_str());

        self.audit_ok(
            "tab.wait_for",
            Some(&tab.to_string()),
            json!({ "state": want.as_str(), "reached": reached }),
            RiskTier::T1Read,
            taint,
        )?;
        Ok(Tainted::system(json!(reached)))
    }

    fn tab_extract(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let tab = arg_id(args, 0, "tab.extract", ObjectKind::Tab)?;
        let kind = arg_str(args, 1, "tab.extract", "kind")?;
        let kind = ExtractKind::parse(kind)
            .ok_or_else(|| KernelError::Validation(format!("unknown extract kind '{}'", kind)))?;

        self.broker
            .require(&self.principal, "tab.extract", &tab.to_string(), None)?;
        self.objects
            .get(tab)
            .ok_or_else(|| KernelError::ObjectNotFound { id: tab.to_string() })?;

        let extracted = self.extract_with_retry(tab, kind)?;
        self.audit_ok(
            "tab.extract",
            Some(&tab.to_string()),
            json!({ "kind": kind.as_str() }),
            RiskTier::T1Read,
            taint,
        )?;
        // Everything the renderer hands back is web content.
        Ok(Tainted::web(extracted))
    }

    fn tab_close(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let tab = arg_id(args, 0, "tab.close", ObjectKind::Tab)?;
        self.broker
            .require(&self.principal, "tab.close", &tab.to_string(), None)?;
        self.renderer.dispose(tab)?;
        let displaced = self.objects.dispose(tab)?;
        self.journal(tab, Touch::Disposed(displaced))?;
        self.audit_ok(
            "tab.close",
            Some(&tab.to_string()),
            JsonValue::Null,
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(true)))
    }

    // --- form ---

    fn form_find(
        &mut self,
        taint: Provenance,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        let tab = arg_id(args, 0, "form.find", ObjectKind::Tab)?;
        let kind = kwargs
            .get("kind")
            .map(|k| k.value.as_str().unwrap_or_default().to_string())
            .or_else(|| {
                args.get(1)
                    .and_then(|a| a.value.as_str())
                    .map(|s| s.to_string())
            })
            .ok_or_else(|| KernelError::Validation("form.find: missing kind".to_string()))?;
        if !FORM_KINDS.contains(&kind.as_str()) {
            return Err(KernelError::Validation(format!(
                "unknown form kind '{}'",
                kind
            )));
        }

        self.broker
            .require(&self.principal, "form.find", "form:*", None)?;
        self.objects
            .get(tab)
            .ok_or_else(|| KernelError::ObjectNotFound { id: tab.to_string() })?;

        let forms = self.extract_with_retry(tab, ExtractKind::Forms)?;
        let matched = forms
            .as_array()
            .and_then(|forms| {
                forms
                    .iter()
                    .find(|f| f.get("kind").and_then(|k| k.as_str()) == Some(kind.as_str()))
                    .cloned()
            })
            .ok_or_else(|| {
                KernelError::NotFound(format!("no {} form on {}", kind, tab))
            })?;

        let mut fields = serde_json::Map::new();
        if let Some(names) = matched.get("fields").and_then(|f| f.as_array()) {
            for name in names.iter().filter_map(|n| n.as_str()) {
                fields.insert(name.to_string(), json!(""));
            }
        }
        let mut attrs = Attrs::new();
        attrs.insert("tab_id".to_string(), json!(tab.to_string()));
        attrs.insert("kind".to_string(), json!(kind));
        attrs.insert("fields".to_string(), JsonValue::Object(fields));
        attrs.insert("submitted".to_string(), json!(false));
        attrs.insert("filled_from".to_string(), json!(Provenance::Agent.as_str()));
        let form = self.objects.create(ObjectKind::Form, attrs)?;
        self.journal(form, Touch::Created)?;

        self.audit_ok(
            "form.find",
            Some(&form.to_string()),
            json!({ "tab": tab.to_string(), "kind": kind }),
            RiskTier::T1Read,
            taint,
        )?;
        Ok(Tainted::system(json!(form.to_string())))
    }

    fn form_fill(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let form = arg_id(args, 0, "form.fill", ObjectKind::Form)?;
        let mapping = args
            .get(1)
            .and_then(|m| m.value.as_object())
            .ok_or_else(|| KernelError::Validation("form.fill: mapping must be an object".to_string()))?
            .clone();

        self.broker
            .require(&self.principal, "form.fill", &form.to_string(), None)?;
        let view = self
            .objects
            .get(form)
            .ok_or_else(|| KernelError::ObjectNotFound { id: form.to_string() })?;

        let mut fields = view
            .get("fields")
            .and_then(|f| f.as_object())
            .cloned()
            .unwrap_or_default();
        for (key, value) in mapping.iter() {
            fields.insert(key.clone(), value.clone());
        }

        // Taint sticks to the form: a later submit of web-derived fill data
        // hits the firewall even though the submit call itself is clean.
        let filled_from = view
            .str_attr("filled_from")
            .and_then(parse_provenance)
            .unwrap_or(Provenance::Agent)
            .combine(taint);

        let mut patch = Attrs::new();
        patch.insert("fields".to_string(), JsonValue::Object(fields));
        patch.insert("filled_from".to_string(), json!(filled_from.as_str()));
        let displaced = self.objects.update(form, patch, None)?;
        self.journal(form, Touch::Mutated(displaced))?;

        self.audit_ok(
            "form.fill",
            Some(&form.to_string()),
            JsonValue::Object(mapping),
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(true)))
    }

    fn form_submit(
        &mut self,
        taint: Provenance,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        let form = arg_id(args, 0, "form.submit", ObjectKind::Form)?;
        let view = self
            .objects
            .get(form)
            .ok_or_else(|| KernelError::ObjectNotFound { id: form.to_string() })?;

        let filled_from = view
            .str_attr("filled_from")
            .and_then(parse_provenance)
            .unwrap_or(Provenance::Agent);
        if filled_from == Provenance::WebContent {
            self.audit_error(
                "form.submit",
                Some(&form.to_string()),
                "firewall",
                AuditResult::Denied,
                filled_from,
            )?;
            return Err(KernelError::Security {
                rule: "t3-web-content".to_string(),
                op: "form.submit".to_string(),
                provenance: filled_from,
            });
        }

        let tx = self.innermost_tx();
        if let Some(tx) = tx {
            self.coordinator.t3_admit(tx, "form.submit")?;
        }
        if let Err(err) = self
            .broker
            .require(&self.principal, "form.submit", &form.to_string(), None)
        {
            if let Some(tx) = tx {
                self.coordinator.t3_complete(tx, false)?;
            }
            return Err(err);
        }

        let mut patch = Attrs::new();
        patch.insert("submitted".to_string(), json!(true));
        if let Some(values) = kwargs.get("values").and_then(|v| v.value.as_object()) {
            let mut fields = view
                .get("fields")
                .and_then(|f| f.as_object())
                .cloned()
                .unwrap_or_default();
            for (key, value) in values {
                fields.insert(key.clone(), value.clone());
            }
            patch.insert("fields".to_string(), JsonValue::Object(fields));
        }
        let mut expected = Attrs::new();
        expected.insert("submitted".to_string(), json!(false));
        let update = self.objects.update(form, patch, Some(&expected));
        let displaced = match update {
            Ok(displaced) => displaced,
            Err(err) => {
                if let Some(tx) = tx {
                    self.coordinator.t3_complete(tx, false)?;
                }
                return Err(err);
            }
        };
        self.journal(form, Touch::Mutated(displaced))?;

        self.audit_ok(
            "form.submit",
            Some(&form.to_string()),
            json!({ "kind": view.str_attr("kind") }),
            RiskTier::T3Irreversible,
            taint,
        )?;
        if let Some(tx) = tx {
            self.coordinator.t3_complete(tx, true)?;
        }
        Ok(Tainted::system(json!(true)))
    }

    // --- workspace ---

    fn workspace_create(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let name = arg_str(args, 0, "workspace.create", "name")?.to_string();
        self.broker
            .require(&self.principal, "workspace.create", "workspace:*", None)?;

        let mut attrs = Attrs::new();
        attrs.insert("name".to_string(), json!(name));
        attrs.insert("tab_ids".to_string(), json!([]));
        attrs.insert("credential_ids".to_string(), json!([]));
        attrs.insert("policy_ref".to_string(), JsonValue::Null);
        let workspace = self.objects.create(ObjectKind::Workspace, attrs)?;
        self.journal(workspace, Touch::Created)?;

        self.audit_ok(
            "workspace.create",
            Some(&workspace.to_string()),
            json!({ "name": name }),
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(workspace.to_string())))
    }

    fn workspace_attach(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let workspace = arg_id(args, 0, "workspace.attach", ObjectKind::Workspace)?;
        let tab = arg_id(args, 1, "workspace.attach", ObjectKind::Tab)?;
        self.broker
            .require(&self.principal, "workspace.attach", &workspace.to_string(), None)?;
        self.objects
            .get(tab)
            .ok_or_else(|| KernelError::ObjectNotFound { id: tab.to_string() })?;

        self.attach_tab_to_workspace(workspace, tab)?;
        self.audit_ok(
            "workspace.attach",
            Some(&workspace.to_string()),
            json!({ "tab": tab.to_string() }),
            RiskTier::T2Stateful,
            taint,
        )?;
        Ok(Tainted::system(json!(true)))
    }

    // --- credential ---

    fn credential_use(&mut self, taint: Provenance, args: &[Tainted]) -> Result<Tainted, KernelError> {
        let credential = arg_id(args, 0, "credential.use", ObjectKind::Credential)?;
        let tx = self.innermost_tx();
        if let Some(tx) = tx {
            self.coordinator.t3_admit(tx, "credential.use")?;
        }
        if let Err(err) =
            self.broker
                .require(&self.principal, "credential.use", &credential.to_string(), None)
        {
            if let Some(tx) = tx {
                self.coordinator.t3_complete(tx, false)?;
            }
            return Err(err);
        }
        if self.objects.get(credential).is_none() {
            if let Some(tx) = tx {
                self.coordinator.t3_complete(tx, false)?;
            }
            return Err(KernelError::ObjectNotFound {
                id: credential.to_string(),
            });
        }

        // The bearer reference is opaque; secret material never transits
        // the object manager or the audit log.
        let bearer = format!("bearer:{}", time::new_ulid());
        self.audit_ok(
            "credential.use",
            Some(&credential.to_string()),
            JsonValue::Null,
            RiskTier::T3Irreversible,
            taint,
        )?;
        if let Some(tx) = tx {
            self.coordinator.t3_complete(tx, true)?;
        }
        Ok(Tainted::system(json!(bearer)))
    }

    // --- governance / audit ---

    fn human_approve(
        &mut self,
        args: &[Tainted],
        kwargs: &BTreeMap<String, Tainted>,
    ) -> Result<Tainted, KernelError> {
        let prompt = arg_str(args, 0, "human.approve", "prompt")?.to_string();
        self.broker
            .require(&self.principal, "human.approve", "system:approval", None)?;

        let tier = kwargs
            .get("tier")
            .and_then(|t| t.value.as_str())
            .and_then(RiskTier::parse)
            .unwrap_or(RiskTier::T3Irreversible);
        let decision = self.approver.approve(&prompt, tier);

        // A grant request rides along: approvals scope a capability for the
        // named operation, once or for the rest of the session.
        let scoped_op = kwargs.get("op").and_then(|o| o.value.as_str());
        let scoped_resource = kwargs.get("resource").and_then(|r| r.value.as_str());
        if decision != ApprovalDecision::Deny {
            if let (Some(op), Some(resource)) = (scoped_op, scoped_resource) {
                let constraints = match decision {
                    ApprovalDecision::ApproveOnce => Constraints {
                        uses_remaining: Some(1),
                        ..Constraints::default()
                    },
                    _ => Constraints::default(),
                };
                self.broker.grant(
                    &self.principal,
                    op,
                    resource,
                    op_tier(op).unwrap_or(tier),
                    None,
                    constraints,
                )?;
            }
        }

        let approved = decision != ApprovalDecision::Deny;
        self.audit_ok(
            "human.approve",
            None,
            json!({ "prompt": prompt, "approved": approved }),
            RiskTier::T1Read,
            Provenance::User,
        )?;
        Ok(Tainted::system(json!(approved)))
    }

    fn audit_query(&mut self, kwargs: &BTreeMap<String, Tainted>) -> Result<Tainted, KernelError> {
        self.broker
            .require(&self.principal, "audit.query", "audit:log", None)?;

        let filter = crate::kernel::audit::AuditFilter {
            // Agents only see their own stream.
            principal: Some(self.principal.clone()),
            op_glob: kwargs
                .get("op")
                .and_then(|o| o.value.as_str())
                .map(|s| s.to_string()),
            limit: kwargs
                .get("limit")
                .and_then(|l| l.value.as_u64())
                .map(|l| l as usize),
            ..Default::default()
        };
        let entries = self.audit.query(&filter)?;
        let value = serde_json::to_value(&entries)
            .map_err(|e| KernelError::AuditQuery { cause: e.to_string() })?;

        self.audit_ok(
            "audit.query",
            None,
            json!({ "matches": entries.len() }),
            RiskTier::T1Read,
            Provenance::System,
        )?;
        Ok(Tainted::system(value))
    }

    // --- shared plumbing ---

    fn attach_tab_to_workspace(&mut self, workspace: ObjectId, tab: ObjectId) -> Result<(), KernelError> {
        let view = self
            .objects
            .get(workspace)
            .ok_or_else(|| KernelError::ObjectNotFound { id: workspace.to_string() })?;
        let mut tab_ids = view
            .get("tab_ids")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        let tab_str = json!(tab.to_string());
        if !tab_ids.contains(&tab_str) {
            tab_ids.push(tab_str);
        }
        let mut patch = Attrs::new();
        patch.insert("tab_ids".to_string(), JsonValue::Array(tab_ids));
        let displaced = self.objects.update(workspace, patch, None)?;
        self.journal(workspace, Touch::Mutated(displaced))?;

        let mut tab_patch = Attrs::new();
        tab_patch.insert("workspace_id".to_string(), json!(workspace.to_string()));
        let displaced = self.objects.update(tab, tab_patch, None)?;
        self.journal(tab, Touch::Mutated(displaced))?;
        Ok(())
    }

    fn journal(&self, id: ObjectId, touch: Touch) -> Result<(), KernelError> {
        if let Some(tx) = self.innermost_tx() {
            self.coordinator.record_touch(tx, id, touch)?;
        }
        Ok(())
    }

    fn navigate_with_retry(&self, tab: ObjectId, url: &str) -> Result<LoadState, KernelError> {
        self.with_renderer_retry(|renderer| renderer.navigate(tab, url))
    }

    fn extract_with_retry(&self, tab: ObjectId, kind: ExtractKind) -> Result<JsonValue, KernelError> {
        self.with_renderer_retry(|renderer| renderer.extract(tab, kind))
    }

    /// Transient renderer failures retry with bounded exponential backoff.
    /// Capability errors never reach this path and are never retried.
    fn with_renderer_retry<T>(
        &self,
        call: impl Fn(&dyn Renderer) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let mut attempt = 0;
        loop {
            match call(self.renderer.as_ref()) {
                Ok(value) => return Ok(value),
                Err(KernelError::Renderer { transient: true, .. })
                    if attempt < self.renderer_retries =>
                {
                    let backoff = self.renderer_backoff_ms << attempt;
                    std::thread::sleep(std::time::Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn audit_ok(
        &self,
        op: &str,
        object: Option<&str>,
        args: JsonValue,
        tier: RiskTier,
        taint: Provenance,
    ) -> Result<(), KernelError> {
        let tx = self.innermost_tx();
        let mut draft = AuditDraft::new(&self.principal, op, AuditResult::Success)
            .args(args)
            .provenance(taint)
            .risk(tier)
            .tx(tx.map(|t| t.to_string()), None);
        if let Some(object) = object {
            draft = draft.object(object);
        }
        self.audit.log(draft)?;
        Ok(())
    }

    fn audit_error(
        &self,
        op: &str,
        object: Option<&str>,
        error_kind: &str,
        result: AuditResult,
        taint: Provenance,
    ) -> Result<(), KernelError> {
        if self.mode == Mode::DryRun {
            return Ok(());
        }
        let tx = self.innermost_tx();
        let mut draft = AuditDraft::new(&self.principal, op, result)
            .error_kind(error_kind)
            .provenance(taint)
            .tx(tx.map(|t| t.to_string()), None);
        if let Some(object) = object {
            draft = draft.object(object);
        }
        self.audit.log(draft)?;
        Ok(())
    }
}

fn generic_resource(op: &str) -> &'static str {
    match op.split('.').next().unwrap_or_default() {
        "tab" => "tab:*",
        "form" => "form:*",
        "workspace" => "workspace:*",
        "credential" => "credential:*",
        "human" => "system:approval",
        "audit" => "audit:log",
        _ => "*",
    }
}

fn parse_provenance(s: &str) -> Option<Provenance> {
    match s {
        "user" => Some(Provenance::User),
        "agent" => Some(Provenance::Agent),
        "web-content" => Some(Provenance::WebContent),
        "system" => Some(Provenance::System),
        _ => None,
    }
}

fn arg_str<'a>(
    args: &'a [Tainted],
    index: usize,
    op: &str,
    name: &str,
) -> Result<&'a str, KernelError> {
    args.get(index)
        .and_then(|a| a.value.as_str())
        .ok_or_else(|| KernelError::Validation(format!("{}: missing {} argument", op, name)))
}

fn arg_id(
    args: &[Tainted],
    index: usize,
    op: &str,
    kind: ObjectKind,
) -> Result<ObjectId, KernelError> {
    let raw = args
        .get(index)
        .map(|a| &a.value)
        .ok_or_else(|| KernelError::Validation(format!("{}: missing object id argument", op)))?;
    parse_id(raw, kind)
}

fn parse_id(value: &JsonValue, kind: ObjectKind) -> Result<ObjectId, KernelError> {
    let raw = value
        .as_str()
        .ok_or_else(|| KernelError::Validation("object id must be a string".to_string()))?;
    let id: ObjectId = raw.parse()?;
    if id.kind != kind {
        return Err(KernelError::Validation(format!(
            "expected a {} id, got '{}'",
            kind.as_str(),
            raw
        )));
    }
    Ok(id)
}
