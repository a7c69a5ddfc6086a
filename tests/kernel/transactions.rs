use portcullis::kernel::Kernel;
use portcullis::kernel::approval::AutoApprover;
use portcullis::kernel::capability::{Constraints, RiskTier};
use portcullis::kernel::config::KernelConfig;
use portcullis::kernel::object::{Attrs, ObjectKind};
use portcullis::kernel::renderer::{MockPage, MockRenderer};
use portcullis::kernel::store::Store;
use portcullis::kernel::transaction::Touch;
use portcullis::runtime::{AgentRuntime, ExecState};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tempfile::tempdir;

fn setup(root: &std::path::Path) -> (Kernel, AgentRuntime) {
    let kernel = Kernel::init(Store::at(root), KernelConfig::default()).expect("kernel init");
    let renderer = Arc::new(MockRenderer::new());
    renderer.script_page(
        "https://a.test",
        MockPage {
            title: "Alpha".to_string(),
            markdown: "# alpha".to_string(),
            forms: json!([{ "kind": "login", "fields": ["username", "password"] }]),
            ..MockPage::default()
        },
    );
    renderer.script_page(
        "https://b.test",
        MockPage {
            title: "Beta".to_string(),
            markdown: "# beta".to_string(),
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
    let runtime = AgentRuntime::new(&kernel, renderer, Arc::new(AutoApprover::deny_all()));
    (kernel, runtime)
}

fn run(runtime: &AgentRuntime, body: serde_json::Value) -> portcullis::runtime::ExecutionResult {
    let source = json!({ "imports": ["browser"], "body": body }).to_string();
    runtime
        .submit("agent:1", &source, Arc::new(AtomicBool::new(false)))
        .expect("admitted")
}

#[test]
fn checkpoint_rollback_restores_navigated_state() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime) = setup(tmp.path());

    let result = run(
        &runtime,
        json!([
            {"stmt": "transaction", "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}},
                {"stmt": "checkpoint", "label": "pre"},
                {"stmt": "call", "call": {"target": "browser.tab.navigate", "args": [{"var": "t"}, "https://b.test"]}},
                {"stmt": "rollback", "label": "pre"},
                {"stmt": "commit"}
            ]}
        ]),
    );
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);

    let tabs = kernel.objects.list_by_type(ObjectKind::Tab);
    assert_eq!(tabs.len(), 1);
    assert_eq!(tabs[0].str_attr("url"), Some("https://a.test"));
}

#[test]
fn transaction_without_commit_aborts_on_scope_exit() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime) = setup(tmp.path());

    let result = run(
        &runtime,
        json!([
            {"stmt": "transaction", "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}}
            ]}
        ]),
    );
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);
    assert!(kernel.objects.list_by_type(ObjectKind::Tab).is_empty());
}

#[test]
fn t3_forces_commit_and_pins_against_rollback() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime) = setup(tmp.path());

    let result = run(
        &runtime,
        json!([
            {"stmt": "transaction", "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}},
                {"stmt": "let", "name": "f", "expr": {"target": "browser.form.find", "args": [{"var": "t"}, "login"]}},
                {"stmt": "call", "call": {"target": "browser.form.fill", "args": [{"var": "f"}, {"username": "casey"}]}},
                {"stmt": "call", "call": {"target": "browser.form.submit", "args": [{"var": "f"}]}},
                {"stmt": "rollback"}
            ]}
        ]),
    );
    assert_eq!(result.state, ExecState::Failed);
    let error = result.error.expect("error");
    assert!(error.contains("irreversible"), "got: {}", error);

    // The T3 commit stuck: the submitted form survived the rollback attempt.
    let forms = kernel.objects.list_by_type(ObjectKind::Form);
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].get("submitted"), Some(&json!(true)));
}

#[test]
fn nested_child_abort_preserves_parent_effects() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime) = setup(tmp.path());

    let result = run(
        &runtime,
        json!([
            {"stmt": "transaction", "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}},
                {"stmt": "transaction", "body": [
                    {"stmt": "call", "call": {"target": "browser.tab.navigate", "args": [{"var": "t"}, "https://b.test"]}}
                ]},
                {"stmt": "commit"}
            ]}
        ]),
    );
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);

    let tabs = kernel.objects.list_by_type(ObjectKind::Tab);
    assert_eq!(tabs.len(), 1, "parent-created tab survives");
    assert_eq!(
        tabs[0].str_attr("url"),
        Some("https://a.test"),
        "aborted child's navigation rolled back"
    );
}

#[test]
fn nested_child_commit_folds_into_parent_rollback_scope() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, runtime) = setup(tmp.path());

    let result = run(
        &runtime,
        json!([
            {"stmt": "transaction", "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}},
                {"stmt": "checkpoint", "label": "before-child"},
                {"stmt": "transaction", "body": [
                    {"stmt": "call", "call": {"target": "browser.tab.navigate", "args": [{"var": "t"}, "https://b.test"]}},
                    {"stmt": "commit"}
                ]},
                {"stmt": "rollback", "label": "before-child"},
                {"stmt": "commit"}
            ]}
        ]),
    );
    assert_eq!(result.state, ExecState::Completed, "error: {:?}", result.error);

    let tabs = kernel.objects.list_by_type(ObjectKind::Tab);
    assert_eq!(
        tabs[0].str_attr("url"),
        Some("https://a.test"),
        "parent rollback crosses the folded child journal"
    );
}

#[test]
fn small_snapshots_restore_bit_identical() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, _runtime) = setup(tmp.path());

    let payload_a = "a".repeat(9 * 1024);
    let mut attrs = Attrs::new();
    attrs.insert("url".to_string(), json!("https://a.test"));
    attrs.insert("body".to_string(), json!(payload_a));
    let id = kernel.objects.create(ObjectKind::Tab, attrs).expect("create");

    let tx = kernel.coordinator.begin("agent:1", None).expect("begin");
    let mut patch = Attrs::new();
    patch.insert("body".to_string(), json!("b".repeat(9 * 1024)));
    let displaced = kernel.objects.update_internal(id, patch, None).expect("update");
    kernel
        .coordinator
        .record_touch(tx, id, Touch::Mutated(displaced))
        .expect("touch");

    kernel.coordinator.rollback(tx, None).expect("rollback");
    let view = kernel.objects.get(id).expect("get");
    assert_eq!(view.get("body"), Some(&json!(payload_a)));
    kernel.coordinator.abort(tx, "test").expect("abort");
}

#[test]
fn large_snapshot_takes_the_reference_path() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, _runtime) = setup(tmp.path());

    // 5 MB payload: the pre-image must be captured by reference, so the
    // checkpoint itself stays far under the 100 ms target.
    let payload_a = "x".repeat(5 * 1024 * 1024);
    let mut attrs = Attrs::new();
    attrs.insert("body".to_string(), json!(payload_a));
    let id = kernel.objects.create(ObjectKind::Tab, attrs).expect("create");

    let tx = kernel.coordinator.begin("agent:1", None).expect("begin");
    let mut patch = Attrs::new();
    patch.insert("body".to_string(), json!("y".repeat(5 * 1024 * 1024)));
    let displaced = kernel.objects.update_internal(id, patch, None).expect("update");
    kernel
        .coordinator
        .record_touch(tx, id, Touch::Mutated(displaced))
        .expect("touch");

    let started = Instant::now();
    kernel.coordinator.checkpoint(tx, "big").expect("checkpoint");
    assert!(
        started.elapsed().as_millis() < 100,
        "checkpoint took {:?}",
        started.elapsed()
    );

    let mut patch = Attrs::new();
    patch.insert("body".to_string(), json!("z"));
    let displaced = kernel.objects.update_internal(id, patch, None).expect("update");
    kernel
        .coordinator
        .record_touch(tx, id, Touch::Mutated(displaced))
        .expect("touch");

    kernel.coordinator.rollback(tx, Some("big")).expect("rollback");
    let view = kernel.objects.get(id).expect("get");
    assert_eq!(
        view.get("body").and_then(|b| b.as_str()).map(|b| b.len()),
        Some(5 * 1024 * 1024)
    );
    assert!(
        view.get("body")
            .and_then(|b| b.as_str())
            .is_some_and(|b| b.starts_with('y')),
        "rollback lands on the checkpointed version"
    );

    kernel.coordinator.rollback(tx, None).expect("rollback to start");
    let view = kernel.objects.get(id).expect("get");
    assert_eq!(view.get("body"), Some(&json!(payload_a)));
    kernel.coordinator.abort(tx, "test").expect("abort");
}

#[test]
fn shutdown_aborts_active_transactions_and_restores_state() {
    let tmp = tempdir().expect("tempdir");
    let (kernel, _runtime) = setup(tmp.path());

    let mut attrs = Attrs::new();
    attrs.insert("name".to_string(), json!("before"));
    let id = kernel
        .objects
        .create(ObjectKind::Workspace, attrs)
        .expect("create");

    let tx = kernel.coordinator.begin("agent:1", None).expect("begin");
    let mut patch = Attrs::new();
    patch.insert("name".to_string(), json!("after"));
    let displaced = kernel.objects.update_internal(id, patch, None).expect("update");
    kernel
        .coordinator
        .record_touch(tx, id, Touch::Mutated(displaced))
        .expect("touch");

    kernel.shutdown().expect("shutdown");
    assert_eq!(
        kernel.objects.get(id).expect("get").str_attr("name"),
        Some("before")
    );
}
