//! Agent program AST.
//!
//! Submissions arrive as JSON-encoded programs and deserialize into this
//! typed tree; parsing *is* the AST construction, and admission walks the
//! result. The language is deliberately tiny: let-bindings, calls into the
//! mediated surface and a small pure stdlib, and scoped transaction blocks
//! with checkpoint/rollback/commit statements.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A parsed agent submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Imported surfaces; admission checks these against the allow-list.
    #[serde(default)]
    pub imports: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum Stmt {
    /// Bind the value of `expr` to `name`.
    Let { name: String, expr: Expr },
    /// Evaluate a call for its effects.
    Call { call: CallExpr },
    /// Scoped transaction: commits only via an explicit `commit` statement;
    /// every other exit path aborts.
    Transaction { body: Vec<Stmt> },
    Checkpoint {
        label: String,
    },
    Rollback {
        #[serde(default)]
        label: Option<String>,
    },
    Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    Call(CallExpr),
    Var { var: String },
    /// Plain JSON literal. Objects using the reserved keys `target` or
    /// `var` parse as the structured variants above.
    Lit(JsonValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallExpr {
    /// Dotted call target, e.g. `browser.tab.open` or `strings.concat`.
    pub target: String,
    #[serde(default)]
    pub args: Vec<Expr>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Expr>,
}

/// Structured pre-execution error: which rule fired and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub rule: String,
    pub location: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(rule: &str, location: &str, message: String) -> Self {
        Self {
            rule: rule.to_string(),
            location: location.to_string(),
            message,
        }
    }
}

/// Parse a source string into a `Program`. A parse failure is reported in
/// the same structured form admission uses.
pub fn parse_program(source: &str) -> Result<Program, Vec<ValidationError>> {
    serde_json::from_str(source).map_err(|e| {
        vec![ValidationError::new(
            "parse",
            "<root>",
            format!("program does not parse: {}", e),
        )]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_program() {
        let source = json!({
            "imports": ["browser"],
            "body": [
                {"stmt": "let", "name": "t", "expr": {"target": "browser.tab.open", "args": ["https://a.test"]}},
                {"stmt": "call", "call": {"target": "browser.tab.extract", "args": [{"var": "t"}, "markdown"]}}
            ]
        })
        .to_string();
        let program = parse_program(&source).expect("parse");
        assert_eq!(program.imports, vec!["browser"]);
        assert_eq!(program.body.len(), 2);
        match &program.body[0] {
            Stmt::Let { name, expr } => {
                assert_eq!(name, "t");
                assert!(matches!(expr, Expr::Call(_)));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_parse_transaction_block() {
        let source = json!({
            "body": [
                {"stmt": "transaction", "body": [
                    {"stmt": "checkpoint", "label": "pre"},
                    {"stmt": "rollback", "label": "pre"},
                    {"stmt": "commit"}
                ]}
            ]
        })
        .to_string();
        let program = parse_program(&source).expect("parse");
        match &program.body[0] {
            Stmt::Transaction { body } => assert_eq!(body.len(), 3),
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_parse_failure_is_structured() {
        let errors = parse_program("not json").expect_err("parse failure");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule, "parse");
    }

    #[test]
    fn test_literal_vs_var() {
        let source = json!({
            "body": [
                {"stmt": "let", "name": "a", "expr": 42},
                {"stmt": "let", "name": "b", "expr": {"var": "a"}}
            ]
        })
        .to_string();
        let program = parse_program(&source).expect("parse");
        match &program.body[0] {
            Stmt::Let { expr: Expr::Lit(v), .. } => assert_eq!(v, &json!(42)),
            other => panic!("unexpected stmt: {:?}", other),
        }
        match &program.body[1] {
            Stmt::Let { expr: Expr::Var { var }, .. } => assert_eq!(var, "a"),
            other => panic!("unexpected stmt: {:?}", other),
        }
    }
}
