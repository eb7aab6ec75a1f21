//! Tool invocation records.

use serde::{Deserialize, Serialize};

/// Lifecycle of a detected tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Detected,
    Running,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, InvocationStatus::Succeeded | InvocationStatus::Failed)
    }
}

/// A request, embedded in model output, to run an external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Unique within the turn that produced it.
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub status: InvocationStatus,
}

impl ToolInvocation {
    #[must_use]
    pub fn detected(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            status: InvocationStatus::Detected,
        }
    }

    /// Advance the status. Resolved invocations never move again.
    pub fn advance(&mut self, next: InvocationStatus) {
        if self.status.is_resolved() {
            return;
        }
        self.status = next;
    }
}
