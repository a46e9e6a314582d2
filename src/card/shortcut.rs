//! Coordinator shortcut states

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the shortcut a coordinator cell holds for one card
///
/// ```text
/// Granting ──grant ok──▶ Granted ──topology change──▶ Revoking ──revoke ok──▶ (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortcutState {
    Granting,
    Granted,
    Revoking,
}

impl ShortcutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortcutState::Granting => "granting",
            ShortcutState::Granted => "granted",
            ShortcutState::Revoking => "revoking",
        }
    }
}

impl fmt::Display for ShortcutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
