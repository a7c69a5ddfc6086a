//! Renderer collaborator boundary.
//!
//! The kernel never talks to a real web engine directly; it sees an opaque
//! collaborator exposing `navigate`, `extract`, and `dispose` over a
//! message-style interface. Calls may block at this boundary and are the
//! only suspension points in a mediated operation. `MockRenderer` stands in
//! for the kernel's own tests: scripted pages, injectable failures, and a
//! call log.

use crate::kernel::error::KernelError;
use crate::kernel::object::ObjectId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Tab load states surfaced by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Loading,
    Interactive,
    Complete,
    Error,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Loading => "loading",
            LoadState::Interactive => "interactive",
            LoadState::Complete => "complete",
            LoadState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<LoadState> {
        match s {
            "loading" => Some(LoadState::Loading),
            "interactive" => Some(LoadState::Interactive),
            "complete" => Some(LoadState::Complete),
            "error" => Some(LoadState::Error),
            _ => None,
        }
    }
}

/// Structured extraction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    Markdown,
    Forms,
    Tables,
    Links,
}

impl ExtractKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractKind::Markdown => "markdown",
            ExtractKind::Forms => "forms",
            ExtractKind::Tables => "tables",
            ExtractKind::Links => "links",
        }
    }

    pub fn parse(s: &str) -> Option<ExtractKind> {
        match s {
            "markdown" => Some(ExtractKind::Markdown),
            "forms" => Some(ExtractKind::Forms),
            "tables" => Some(ExtractKind::Tables),
            "links" => Some(ExtractKind::Links),
            _ => None,
        }
    }
}

/// Opaque renderer collaborator. All methods are bounded by the caller's
/// cancellation/timeout checks at the mediation boundary.
pub trait Renderer: Send + Sync {
    fn navigate(&self, tab: ObjectId, url: &str) -> Result<LoadState, KernelError>;
    fn extract(&self, tab: ObjectId, kind: ExtractKind) -> Result<JsonValue, KernelError>;
    fn dispose(&self, tab: ObjectId) -> Result<(), KernelError>;
}

/// Scripted page content served by the mock.
#[derive(Debug, Clone)]
pub struct MockPage {
    pub title: String,
    pub markdown: String,
    pub forms: JsonValue,
    pub tables: JsonValue,
    pub links: Vec<String>,
}

impl Default for MockPage {
    fn default() -> Self {
        Self {
            title: "Untitled".to_string(),
            markdown: String::new(),
            forms: json!([]),
            tables: json!([]),
            links: Vec::new(),
        }
    }
}

/// In-process mock renderer for kernel tests.
pub struct MockRenderer {
    pages: Mutex<FxHashMap<String, MockPage>>,
    locations: Mutex<FxHashMap<ObjectId, String>>,
    fail_queue: Mutex<VecDeque<KernelError>>,
    calls: Mutex<Vec<String>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(FxHashMap::default()),
            locations: Mutex::new(FxHashMap::default()),
            fail_queue: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script_page(&self, url: &str, page: MockPage) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(url.to_string(), page);
        }
    }

    /// Queue a failure for the next renderer call.
    pub fn inject_failure(&self, cause: &str, transient: bool) {
        if let Ok(mut queue) = self.fail_queue.lock() {
            queue.push_back(KernelError::Renderer {
                cause: cause.to_string(),
                transient,
            });
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn take_injected(&self) -> Option<KernelError> {
        self.fail_queue.lock().ok()?.pop_front()
    }
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for MockRenderer {
    fn navigate(&self, tab: ObjectId, url: &str) -> Result<LoadState, KernelError> {
        self.record(format!("navigate:{}:{}", tab, url));
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let pages = self
            .pages
            .lock()
            .map_err(|_| KernelError::Renderer {
                cause: "mock page lock poisoned".to_string(),
                transient: false,
            })?;
        if pages.contains_key(url) {
            if let Ok(mut locations) = self.locations.lock() {
                locations.insert(tab, url.to_string());
            }
            Ok(LoadState::Complete)
        } else {
            Ok(LoadState::Error)
        }
    }

    fn extract(&self, tab: ObjectId, kind: ExtractKind) -> Result<JsonValue, KernelError> {
        self.record(format!("extract:{}:{}", tab, kind.as_str()));
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let url = self
            .locations
            .lock()
            .ok()
            .and_then(|locations| locations.get(&tab).cloned())
            .ok_or_else(|| KernelError::Renderer {
                cause: format!("{} has no loaded page", tab),
                transient: false,
            })?;
        let pages = self
            .pages
            .lock()
            .map_err(|_| KernelError::Renderer {
                cause: "mock page lock poisoned".to_string(),
                transient: false,
            })?;
        let page = pages.get(&url).cloned().unwrap_or_default();
        Ok(match kind {
            ExtractKind::Markdown => json!({ "title": page.title, "markdown": page.markdown }),
            ExtractKind::Forms => page.forms,
            ExtractKind::Tables => page.tables,
            ExtractKind::Links => json!(page.links),
        })
    }

    fn dispose(&self, tab: ObjectId) -> Result<(), KernelError> {
        self.record(format!("dispose:{}", tab));
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        Ok(())
    }
}
