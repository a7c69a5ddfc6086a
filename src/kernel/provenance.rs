//! Provenance tags for data flowing through the mediation layer.
//!
//! Every value an agent program manipulates carries an origin tag. Tags are
//! propagated by the mediation layer and consulted by the capability
//! firewall: irreversible operations driven by web-derived data are refused
//! before the broker is ever consulted.

use serde::{Deserialize, Serialize};

/// Origin tag on data: `user`, `agent`, `web-content`, `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    User,
    Agent,
    WebContent,
    System,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::User => "user",
            Provenance::Agent => "agent",
            Provenance::WebContent => "web-content",
            Provenance::System => "system",
        }
    }

    /// Taint dominance: web-content taints everything it touches.
    pub fn combine(self, other: Provenance) -> Provenance {
        if self == Provenance::WebContent || other == Provenance::WebContent {
            Provenance::WebContent
        } else if self == Provenance::User || other == Provenance::User {
            Provenance::User
        } else if self == Provenance::Agent || other == Provenance::Agent {
            Provenance::Agent
        } else {
            Provenance::System
        }
    }
}
