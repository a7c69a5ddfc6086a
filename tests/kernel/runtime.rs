use portcullis::kernel::Kernel;
use portcullis::kernel::approval::{ApprovalDecision, AutoApprover};
use portcullis::kernel::audit::{AuditFilter, AuditResult};
use portcullis::kernel::capability::{Constraints, RiskTier};
use portcullis::kernel::config::KernelConfig;
use portcullis::kernel::object::ObjectKind;
use portcullis::kernel::renderer::{MockPage, MockRenderer};
use portcullis::kernel::store::Store;
use portcullis::runtime::{AgentRuntime, ExecState};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

fn setup_with(
    root: &std::path::Path,
    config: KernelConfig,
    approver: AutoApprover,
) -> (Kernel, AgentRuntime, Arc<MockRenderer>) {
    let kernel = Kernel::init(Store::at(root), config).expect("kernel init");
    let renderer = Arc::new(MockRenderer::new());
    renderer.script_page(
        "https://site.test/login",
        MockPage {
            title: "Login".to_string(),
            markdown: "# Sign in\nuse code 1234".to_string(),
            forms: json!([{ "kind": "login", "fields": ["username", "password"] }]),
            links: vec!["https://site.test/help".to_string()],
            ..MockPage::default()
        },
    );
    kernel
        .broker
        .grant(
            "agent:1",
            "**",
            "**",
            RiskTier::T3Irreversible,
            None,
            Constraints::default(),
        )
        .expect("grant");
    let runtime = AgentRuntime::new(
        &kernel,
        Arc::clone(&renderer) as Arc<dyn portcullis::kernel::renderer::Renderer>,
        Arc::new(approver),
    );
    (kernel, runtime, renderer)
}

fn setup(root: &std::path::Path) -> (Kernel, AgentRuntime, Arc<MockRenderer>) {
    setup_with(root, KernelConfig::default(), AutoApprover::deny_all())
}

fn source(body: serde_json::Value) -> String {
    json!({ "imports": ["browser"], "body": body }).to_string()
}

fn no_cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn admission_refuses_unlisted_imports_and_raw_io() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    let bad = json!({
        "imports": ["browser", "subprocess"],
        "body": [
            {"stmt": "call", "call": {"target": "fs.read", "args": ["/etc/shadow"]}},
            {"stmt": "call", "call": {"target": "browser.tab.__dict__", "args": []}}
        ]
    })
    .to_string();

    let errors = runtime
        .submit("agent:1", &bad, no_cancel())
        .expect_err("refused");
    let rules: Vec<&str> = errors.iter().map(|e| e.rule.as_str()).collect();
    assert!(rules.contains(&"import-allow-list"));
    assert!(rules.contains(&"raw-io"));
    assert!(rules.contains(&"dunder-access"));

    // Refused before execution: nothing ran, nothing was created.
    assert!(kernel.objects.list_by_type(ObjectKind::Tab).is_empty());
}

#[test]
fn web_content_taint_cannot_drive_t3_calls() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    // Extract page content (web provenance), pass a derived value into the
    // T3 submit.
    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                {"stmt": "let", "name": "page", "expr": {"target": "browser.tab.extract", "args": [{"var": "t"}, "markdown"]}},
                {"stmt": "let", "name": "f", "expr": {"target": "browser.form.find", "args": [{"var": "t"}, "login"]}},
                {"stmt": "call", "call": {
                    "target": "browser.form.submit",
                    "args": [{"var": "f"}],
                    "kwargs": {"values": {"var": "page"}}
                }}
            ])),
            no_cancel(),
        )
        .expect("admitted");

    assert_eq!(result.state, ExecState::Failed);
    assert!(result.error.expect("error").contains("t3-web-content"));

    // Exactly one denied entry, kind=firewall; no submission occurred.
    let denied = kernel
        .audit
        .query(&AuditFilter {
            result: Some(AuditResult::Denied),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].error_kind.as_deref(), Some("firewall"));
    let forms = kernel.objects.list_by_type(ObjectKind::Form);
    assert_eq!(forms[0].get("submitted"), Some(&json!(false)));
}

#[test]
fn taint_propagates_through_fill_into_submit() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                {"stmt": "let", "name": "page", "expr": {"target": "browser.tab.extract", "args": [{"var": "t"}, "markdown"]}},
                {"stmt": "let", "name": "f", "expr": {"target": "browser.form.find", "args": [{"var": "t"}, "login"]}},
                {"stmt": "let", "name": "u", "expr": {"target": "records.make", "kwargs": {"username": {"target": "json.get", "args": [{"var": "page"}, "markdown"]}}}},
                {"stmt": "call", "call": {"target": "browser.form.fill", "args": [{"var": "f"}, {"var": "u"}]}},
                {"stmt": "call", "call": {"target": "browser.form.submit", "args": [{"var": "f"}]}}
            ])),
            no_cancel(),
        )
        .expect("admitted");

    assert_eq!(result.state, ExecState::Failed);
    assert!(result.error.expect("error").contains("t3-web-content"));
    let forms = kernel.objects.list_by_type(ObjectKind::Form);
    assert_eq!(forms[0].get("submitted"), Some(&json!(false)));
}

#[test]
fn operation_budget_exhaustion_aborts_open_transactions() {
    let tmp = tempdir().expect("tempdir");
    let config = KernelConfig {
        op_budget: 4,
        ..KernelConfig::default()
    };
    let (kernel, runtime, _renderer) = setup_with(tmp.path(), config, AutoApprover::deny_all());

    // One open plus four waits: the fifth mediated call crosses the budget.
    let body = json!([
        {"stmt": "transaction", "body": [
            {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
            {"stmt": "call", "call": {"target": "browser.tab.wait_for", "args": [{"var": "t"}, "complete"]}},
            {"stmt": "call", "call": {"target": "browser.tab.wait_for", "args": [{"var": "t"}, "complete"]}},
            {"stmt": "call", "call": {"target": "browser.tab.wait_for", "args": [{"var": "t"}, "complete"]}},
            {"stmt": "call", "call": {"target": "browser.tab.wait_for", "args": [{"var": "t"}, "complete"]}},
            {"stmt": "commit"}
        ]}
    ]);

    let result = runtime
        .submit("agent:1", &source(body), no_cancel())
        .expect("admitted");
    assert_eq!(result.state, ExecState::BudgetExhausted);
    assert_eq!(result.ops_used, 4);

    // Open transaction aborted, tab rolled away.
    assert!(kernel.objects.list_by_type(ObjectKind::Tab).is_empty());

    // Final audit entry records the quota violation.
    let last = kernel.audit.last().expect("last").expect("entry");
    assert!(
        last.error_kind.as_deref() == Some("quota_exceeded")
            || last.op == "tx.abort",
        "unexpected final entry: {} / {:?}",
        last.op,
        last.error_kind
    );
    let quota_entries = kernel
        .audit
        .query(&AuditFilter {
            result: Some(AuditResult::Error),
            ..Default::default()
        })
        .expect("query");
    assert!(
        quota_entries
            .iter()
            .any(|e| e.error_kind.as_deref() == Some("quota_exceeded"))
    );
}

#[test]
fn zero_timeout_surfaces_timed_out() {
    let tmp = tempdir().expect("tempdir");
    let config = KernelConfig {
        timeout_ms: 0,
        ..KernelConfig::default()
    };
    let (kernel, runtime, _renderer) = setup_with(tmp.path(), config, AutoApprover::deny_all());

    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "call", "call": {"target": "browser.tab.open", "args": ["https://site.test/login"]}}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::TimedOut);

    let errors = kernel
        .audit
        .query(&AuditFilter {
            result: Some(AuditResult::Error),
            ..Default::default()
        })
        .expect("query");
    assert!(errors.iter().any(|e| e.error_kind.as_deref() == Some("timeout")));
}

#[test]
fn cancellation_is_observed_at_call_boundaries() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    let cancel = Arc::new(AtomicBool::new(true));
    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "transaction", "body": [
                    {"stmt": "call", "call": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                    {"stmt": "commit"}
                ]}
            ])),
            cancel,
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Failed);
    assert!(result.error.expect("error").contains("cancelled"));

    let errors = kernel
        .audit
        .query(&AuditFilter {
            result: Some(AuditResult::Error),
            ..Default::default()
        })
        .expect("query");
    assert!(errors.iter().any(|e| e.error_kind.as_deref() == Some("cancelled")));
    assert!(kernel.objects.list_by_type(ObjectKind::Tab).is_empty());
}

#[test]
fn dry_run_collects_the_required_capability_set() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    let required = runtime
        .dry_run(
            "agent:2",
            &source(json!([
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                {"stmt": "let", "name": "f", "expr": {"target": "browser.form.find", "args": [{"var": "t"}, "login"]}},
                {"stmt": "call", "call": {"target": "browser.form.fill", "args": [{"var": "f"}, {"username": "casey"}]}},
                {"stmt": "call", "call": {"target": "browser.form.submit", "args": [{"var": "f"}]}}
            ])),
        )
        .expect("inferred");

    let ops: Vec<(&str, &str)> = required
        .iter()
        .map(|r| (r.op.as_str(), r.resource.as_str()))
        .collect();
    assert!(ops.contains(&("tab.open", "tab:*")));
    assert!(ops.contains(&("form.fill", "form:*")));
    assert!(ops.contains(&("form.submit", "form:*")));
    assert!(
        required
            .iter()
            .any(|r| r.op == "form.submit" && r.tier == RiskTier::T3Irreversible)
    );

    // Stubbed execution: no objects, no audit entries for agent:2.
    assert!(kernel.objects.list_by_type(ObjectKind::Tab).is_empty());
    let entries = kernel
        .audit
        .query(&AuditFilter {
            principal: Some("agent:2".to_string()),
            ..Default::default()
        })
        .expect("query");
    assert!(entries.is_empty());
}

#[test]
fn successful_mutation_lands_in_the_audit_stream() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup(tmp.path());

    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                {"stmt": "call", "call": {"target": "browser.tab.navigate", "args": [{"var": "t"}, "https://site.test/login"]}}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);
    assert!(result.audit_range.0.is_some() && result.audit_range.1.is_some());

    let tabs = kernel.objects.list_by_type(ObjectKind::Tab);
    let entries = kernel
        .audit
        .query(&AuditFilter {
            op_glob: Some("tab.navigate".to_string()),
            result: Some(AuditResult::Success),
            ..Default::default()
        })
        .expect("query");
    let last = entries.last().expect("entry");
    assert_eq!(last.object_id.as_deref(), Some(tabs[0].id.to_string().as_str()));
    assert_eq!(last.risk_tier, Some(RiskTier::T2Stateful));
}

#[test]
fn approve_once_feeds_a_single_use_grant() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, _renderer) = setup_with(
        tmp.path(),
        KernelConfig::default(),
        AutoApprover::new(ApprovalDecision::ApproveOnce),
    );
    // A second principal with only the approval surface.
    kernel
        .broker
        .grant(
            "agent:9",
            "human.approve",
            "system:approval",
            RiskTier::T1Read,
            None,
            Constraints::default(),
        )
        .expect("grant");

    let result = runtime
        .submit(
            "agent:9",
            &source(json!([
                {"stmt": "call", "call": {
                    "target": "browser.human.approve",
                    "args": ["submit the order form?"],
                    "kwargs": {"op": "form.submit", "resource": "form:1"}
                }}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);

    let caps = kernel.broker.list("agent:9").expect("list");
    let granted = caps
        .iter()
        .find(|c| c.operation_pattern == "form.submit")
        .expect("scoped grant");
    assert_eq!(granted.constraints.uses_remaining, Some(1));
    assert_eq!(granted.resource_pattern, "form:1");
}

#[test]
fn renderer_transient_failures_retry_and_fatal_ones_abort() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime, renderer) = setup(tmp.path());

    // One transient failure, then success: the retry absorbs it.
    renderer.inject_failure("connection reset", true);
    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "call", "call": {"target": "browser.tab.open", "args": ["https://site.test/login"]}}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);
    assert_eq!(kernel.objects.list_by_type(ObjectKind::Tab).len(), 1);

    // A fatal failure inside a transaction aborts it.
    renderer.inject_failure("renderer crashed", false);
    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "transaction", "body": [
                    {"stmt": "call", "call": {"target": "browser.tab.open", "args": ["https://site.test/login"]}},
                    {"stmt": "commit"}
                ]}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Failed);
    assert_eq!(
        kernel.objects.list_by_type(ObjectKind::Tab).len(),
        1,
        "aborted transaction rolled the second tab away"
    );
}

#[test]
fn capability_denial_is_structured_and_not_retried() {
    let tmp = tempdir().expect("tempdir");
    let kernel = Kernel::init(Store::at(tmp.path()), KernelConfig::default()).expect("init");
    let renderer = Arc::new(MockRenderer::new());
    renderer.script_page("https://site.test/login", MockPage::default());
    let calls_before = renderer.calls().len();
    let runtime = AgentRuntime::new(
        &kernel,
        Arc::clone(&renderer) as Arc<dyn portcullis::kernel::renderer::Renderer>,
        Arc::new(AutoApprover::deny_all()),
    );

    // No grants at all.
    let result = runtime
        .submit(
            "agent:1",
            &source(json!([
                {"stmt": "call", "call": {"target": "browser.tab.open", "args": ["https://site.test/login"]}}
            ])),
            no_cancel(),
        )
        .expect("admitted");
    assert_eq!(result.state, ExecState::Failed);
    assert!(result.error.expect("error").contains("no_grant"));
    assert_eq!(
        renderer.calls().len(),
        calls_before,
        "denied call never reached the renderer"
    );

    let denied = kernel
        .audit
        .query(&AuditFilter {
            result: Some(AuditResult::Denied),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].error_kind.as_deref(), Some("no_grant"));
}
