//! Static code admission.
//!
//! Walks a parsed program and refuses anything outside the vetted surface:
//! imports not on the allow-list, eval/exec-style primitives, identifiers
//! touching double-underscored names, raw network or filesystem roots, and
//! form kinds outside the closed enumeration. A single violation refuses
//! execution; the full list is returned so the submitter can fix all of it
//! at once. There is no mechanism to extend the allow-list at runtime.

use crate::runtime::program::{CallExpr, Expr, Program, Stmt, ValidationError};
use serde_json::Value as JsonValue;

/// Importable surface: `browser` plus a small pure stdlib.
pub const IMPORT_ALLOW_LIST: &[&str] = &["browser", "strings", "math", "json", "records"];

/// Host primitives that must never be reachable from agent code.
const FORBIDDEN_CALLS: &[&str] = &["eval", "exec", "compile", "spawn"];

/// Raw I/O roots the mediated surface replaces.
const FORBIDDEN_ROOTS: &[&str] = &["net", "fs", "socket", "file", "os", "process"];

/// Closed enumeration of form kinds.
pub const FORM_KINDS: &[&str] = &["login", "search", "generic"];

/// Walk the program; an empty result admits it.
pub fn admit(program: &Program) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (i, import) in program.imports.iter().enumerate() {
        if !IMPORT_ALLOW_LIST.contains(&import.as_str()) {
            errors.push(ValidationError::new(
                "import-allow-list",
                &format!("imports[{}]", i),
                format!("import '{}' is not allow-listed", import),
            ));
        }
    }

    walk_stmts(&program.body, "body", &mut errors);
    errors
}

fn walk_stmts(stmts: &[Stmt], location: &str, errors: &mut Vec<ValidationError>) {
    for (i, stmt) in stmts.iter().enumerate() {
        let loc = format!("{}[{}]", location, i);
        match stmt {
            Stmt::Let { name, expr } => {
                check_identifier(name, &loc, errors);
                walk_expr(expr, &format!("{}.expr", loc), errors);
            }
            Stmt::Call { call } => walk_call(call, &format!("{}.call", loc), errors),
            Stmt::Transaction { body } => walk_stmts(body, &format!("{}.body", loc), errors),
            Stmt::Checkpoint { label } => check_identifier(label, &loc, errors),
            Stmt::Rollback { label } => {
                if let Some(label) = label {
                    check_identifier(label, &loc, errors);
                }
            }
            Stmt::Commit => {}
        }
    }
}

fn walk_expr(expr: &Expr, location: &str, errors: &mut Vec<ValidationError>) {
    match expr {
        Expr::Call(call) => walk_call(call, location, errors),
        Expr::Var { var } => check_identifier(var, location, errors),
        Expr::Lit(_) => {}
    }
}

fn walk_call(call: &CallExpr, location: &str, errors: &mut Vec<ValidationError>) {
    let segments: Vec<&str> = call.target.split('.').collect();

    for segment in &segments {
        if segment.contains("__") {
            errors.push(ValidationError::new(
                "dunder-access",
                location,
                format!("attribute access on '{}' is refused", segment),
            ));
        }
    }

    if let Some(root) = segments.first() {
        if FORBIDDEN_ROOTS.contains(root) {
            errors.push(ValidationError::new(
                "raw-io",
                location,
                format!("raw {} primitives are not available", root),
            ));
        } else if !IMPORT_ALLOW_LIST.contains(root) {
            errors.push(ValidationError::new(
                "unknown-surface",
                location,
                format!("call target '{}' is outside the bound surface", call.target),
            ));
        }
    }

    if let Some(last) = segments.last() {
        if FORBIDDEN_CALLS.contains(last) {
            errors.push(ValidationError::new(
                "dynamic-execution",
                location,
                format!("'{}' is a refused execution primitive", last),
            ));
        }
    }

    if call.target == "browser.form.find" {
        check_form_kind(call, location, errors);
    }

    for (i, arg) in call.args.iter().enumerate() {
        walk_expr(arg, &format!("{}.args[{}]", location, i), errors);
    }
    for (key, value) in &call.kwargs {
        check_identifier(key, location, errors);
        walk_expr(value, &format!("{}.kwargs.{}", location, key), errors);
    }
}

/// Unknown form kinds are rejected before execution, not at dispatch time.
fn check_form_kind(call: &CallExpr, location: &str, errors: &mut Vec<ValidationError>) {
    let kind = call
        .kwargs
        .get("kind")
        .or_else(|| call.args.get(1));
    if let Some(Expr::Lit(JsonValue::String(kind))) = kind {
        if !FORM_KINDS.contains(&kind.as_str()) {
            errors.push(ValidationError::new(
                "form-kind",
                location,
                format!("unknown form kind '{}'", kind),
            ));
        }
    }
}

fn check_identifier(name: &str, location: &str, errors: &mut Vec<ValidationError>) {
    if name.contains("__") {
        errors.push(ValidationError::new(
            "dunder-access",
            location,
            format!("identifier '{}' is refused", name),
        ));
    }
}
