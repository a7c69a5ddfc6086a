use portcullis::kernel::Kernel;
use portcullis::kernel::audit::{AuditDraft, AuditFilter, AuditLog, AuditResult, ExportFormat};
use portcullis::kernel::capability::{Constraints, DenyReason, RiskTier};
use portcullis::kernel::config::KernelConfig;
use portcullis::kernel::error::KernelError;
use portcullis::kernel::object::{Attrs, ObjectKind};
use portcullis::kernel::provenance::Provenance;
use portcullis::kernel::store::Store;
use serde_json::json;
use tempfile::tempdir;

fn kernel_at(root: &std::path::Path) -> Kernel {
    Kernel::init(Store::at(root), KernelConfig::default()).expect("kernel init")
}

#[test]
fn grant_use_revoke_survives_restart() {
    let tmp = tempdir().expect("tempdir");

    {
        let kernel = kernel_at(tmp.path());
        kernel
            .broker
            .grant(
                "agent:1",
                "tab.read",
                "tab:*",
                RiskTier::T1Read,
                None,
                Constraints::default(),
            )
            .expect("grant");
        let tier = kernel
            .broker
            .require("agent:1", "tab.read", "tab:42", None)
            .expect("require");
        assert_eq!(tier, RiskTier::T1Read);

        kernel.broker.revoke_all("agent:1").expect("revoke_all");
        kernel.shutdown().expect("shutdown");
    }

    // Process restart: a fresh kernel over the same store.
    let kernel = kernel_at(tmp.path());
    let err = kernel
        .broker
        .require("agent:1", "tab.read", "tab:42", None)
        .expect_err("revoked after restart");
    match err {
        KernelError::CapabilityDenied { reason, .. } => assert_eq!(reason, DenyReason::Revoked),
        other => panic!("unexpected error: {}", other),
    }

    // No zombie tokens for any (op, resource).
    assert!(
        !kernel
            .broker
            .check("agent:1", "tab.read", "tab:1", None)
            .expect("check")
    );
    assert!(
        !kernel
            .broker
            .check("agent:1", "tab.read", "tab:9999", None)
            .expect("check")
    );
}

#[test]
fn object_ids_are_monotonic_and_never_reused() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());

    let a = kernel
        .objects
        .create(ObjectKind::Tab, Attrs::new())
        .expect("create");
    let b = kernel
        .objects
        .create(ObjectKind::Tab, Attrs::new())
        .expect("create");
    assert!(b.n > a.n, "second id must be strictly greater");

    kernel.objects.dispose_internal(a).expect("dispose");
    let c = kernel
        .objects
        .create(ObjectKind::Tab, Attrs::new())
        .expect("create");
    assert!(c.n > b.n, "disposed ids are never reallocated");
    assert!(kernel.objects.get(a).is_none());
}

#[test]
fn audit_chain_is_dense_per_principal() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());

    for i in 0..4 {
        kernel
            .audit
            .log(
                AuditDraft::new("agent:7", &format!("tab.op{}", i), AuditResult::Success)
                    .provenance(Provenance::Agent),
            )
            .expect("log");
    }
    // A second principal's stream must not interleave into the chain.
    kernel
        .audit
        .log(AuditDraft::new("agent:8", "tab.open", AuditResult::Success))
        .expect("log");

    let entries = kernel
        .audit
        .query(&AuditFilter {
            principal: Some("agent:7".to_string()),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(entries.len(), 4);
    assert!(entries[0].prev_id.is_none());
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_id, Some(pair[0].id));
    }
}

#[test]
fn audit_chain_head_recovers_after_restart() {
    let tmp = tempdir().expect("tempdir");
    let last_id = {
        let kernel = kernel_at(tmp.path());
        kernel
            .audit
            .log(AuditDraft::new("agent:1", "tab.open", AuditResult::Success))
            .expect("log")
    };

    let kernel = kernel_at(tmp.path());
    let id = kernel
        .audit
        .log(AuditDraft::new("agent:1", "tab.close", AuditResult::Success))
        .expect("log");
    let entries = kernel
        .audit
        .query(&AuditFilter {
            principal: Some("agent:1".to_string()),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].id, id);
    assert_eq!(entries[1].prev_id, Some(last_id));
}

#[test]
fn audit_query_supports_op_globs_and_last() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());

    for op in ["tab.open", "tab.navigate", "form.fill"] {
        kernel
            .audit
            .log(AuditDraft::new("agent:1", op, AuditResult::Success))
            .expect("log");
    }

    let tab_ops = kernel
        .audit
        .query(&AuditFilter {
            op_glob: Some("tab.*".to_string()),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(tab_ops.len(), 2);
    assert!(tab_ops.iter().all(|e| e.op.starts_with("tab.")));

    let last = kernel.audit.last().expect("last").expect("entry");
    assert_eq!(last.op, "form.fill");
}

#[test]
fn secrets_never_reach_the_durable_store() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());

    kernel
        .audit
        .log(
            AuditDraft::new("agent:1", "form.fill", AuditResult::Success)
                .object("form:1")
                .args(json!({
                    "username": "casey",
                    "password": "hunter2-super-secret",
                    "session_token": "tok-abcdef",
                })),
        )
        .expect("log");

    let entries = kernel.audit.query(&AuditFilter::default()).expect("query");
    let serialized = serde_json::to_string(&entries).expect("serialize");
    assert!(!serialized.contains("hunter2-super-secret"));
    assert!(!serialized.contains("tok-abcdef"));
    assert!(serialized.contains("<redacted>"));
    assert!(serialized.contains("casey"), "non-sensitive values survive");

    // Sensitive names appear only as salted hashes in export output.
    let mut out = Vec::new();
    kernel
        .audit
        .export(ExportFormat::Jsonl, &AuditFilter::default(), &mut out)
        .expect("export");
    let exported = String::from_utf8(out).expect("utf8");
    assert!(!exported.contains("hunter2-super-secret"));
    let hashed = kernel.audit.hashed_name("password");
    assert!(exported.contains(&format!("password#{}", hashed)));
}

#[test]
fn markdown_export_renders_a_transcript() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());
    kernel
        .audit
        .log(AuditDraft::new("agent:1", "tab.open", AuditResult::Success).object("tab:1"))
        .expect("log");

    let mut out = Vec::new();
    let count = kernel
        .audit
        .export(ExportFormat::Markdown, &AuditFilter::default(), &mut out)
        .expect("export");
    assert_eq!(count, 1);
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("# Kernel Audit Transcript"));
    assert!(text.contains("tab.open"));
    assert!(text.contains("tab:1"));
}

#[test]
fn audit_log_reopens_append_only() {
    let tmp = tempdir().expect("tempdir");
    {
        let log = AuditLog::open(&Store::at(tmp.path())).expect("open");
        log.log(AuditDraft::new("system", "kernel.init", AuditResult::Success))
            .expect("log");
    }
    let log = AuditLog::open(&Store::at(tmp.path())).expect("reopen");
    log.log(AuditDraft::new("system", "kernel.init", AuditResult::Success))
        .expect("log");
    let entries = log.query(&AuditFilter::default()).expect("query");
    assert_eq!(entries.len(), 2);
}

#[test]
fn lifecycle_events_follow_mutation_order() {
    let tmp = tempdir().expect("tempdir");
    let kernel = kernel_at(tmp.path());
    let rx = kernel.objects.subscribe();

    let id = kernel
        .objects
        .create(ObjectKind::Workspace, Attrs::new())
        .expect("create");
    let mut patch = Attrs::new();
    patch.insert("name".to_string(), json!("research"));
    kernel
        .objects
        .update_internal(id, patch, None)
        .expect("update");

    use portcullis::kernel::object::LifecycleEvent;
    assert_eq!(rx.try_recv().expect("ev"), LifecycleEvent::Created(id));
    assert_eq!(rx.try_recv().expect("ev"), LifecycleEvent::Updated(id));
    // Event delivered after the mutation is visible.
    assert_eq!(
        kernel.objects.get(id).expect("get").str_attr("name"),
        Some("research")
    );
}
