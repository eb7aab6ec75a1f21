//! Tool executor framework - core types and helpers.

pub mod builtins;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Whether a tool can change state outside the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    ReadOnly,
    Mutating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ToolParam {
    #[must_use]
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
        }
    }

    #[must_use]
    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
        }
    }
}

/// What the system prompt shows the model about one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ToolParam>,
    pub side_effect: SideEffect,
}

/// Error types for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
    #[error("Tool timed out after {}s: {tool}", elapsed.as_secs_f64())]
    Timeout { tool: String, elapsed: Duration },
    #[error("Tool execution failed: {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("Tool panicked: {tool}: {message}")]
    Panicked { tool: String, message: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Tool cancelled: {tool}")]
    Cancelled { tool: String },
    #[error("Skipped: an earlier {after} call failed")]
    Skipped { after: String },
}

/// Per-invocation tool context.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub invocation_id: String,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
    pub max_output_bytes: usize,
}

/// A tool the model can invoke.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> &[ToolParam];
    fn side_effect(&self) -> SideEffect;
    /// A failure stops later invocations of the same turn from starting.
    fn fail_fast(&self) -> bool {
        false
    }
    fn timeout(&self) -> Option<Duration> {
        None
    }
    fn execute(&self, input: Value, ctx: ToolCtx) -> ToolFut<'_>;
}

/// Tool registry for executors.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Box<dyn ToolExecutor>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Box<dyn ToolExecutor>) -> Result<(), ToolError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn ToolExecutor, ToolError> {
        self.executors
            .get(name)
            .map(std::convert::AsRef::as_ref)
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| ToolDefinition {
                name: exec.name(),
                description: exec.description(),
                parameters: exec.parameters().to_vec(),
                side_effect: exec.side_effect(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(b.name));
        defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Check an invocation input against a tool's declared parameters.
pub fn validate_input(params: &[ToolParam], input: &Value) -> Result<(), ToolError> {
    let Some(object) = input.as_object() else {
        return Err(ToolError::BadArgs {
            message: "input must be an object".to_string(),
        });
    };
    if let Some(unknown) = object
        .keys()
        .find(|key| !params.iter().any(|p| p.name == key.as_str()))
    {
        return Err(ToolError::BadArgs {
            message: format!("unknown parameter '{unknown}'"),
        });
    }
    for param in params.iter().filter(|p| p.required) {
        if !object.get(param.name).is_some_and(Value::is_string) {
            return Err(ToolError::BadArgs {
                message: format!("missing required parameter '{}'", param.name),
            });
        }
    }
    Ok(())
}

/// Read a required string parameter.
pub fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::BadArgs {
            message: format!("missing required parameter '{key}'"),
        })
}

/// Resolve `path` inside `working_dir`, refusing anything that escapes it.
///
/// The target need not exist, but its parent must.
pub fn confine_path(path: &str, working_dir: &Path) -> Result<PathBuf, ToolError> {
    let outside = || ToolError::BadArgs {
        message: format!("path '{path}' is outside the working directory"),
    };
    if path.trim().is_empty() || path.chars().any(char::is_control) {
        return Err(ToolError::BadArgs {
            message: "path is empty or contains control characters".to_string(),
        });
    }
    let input = Path::new(path);
    if input.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(outside());
    }

    let root = std::fs::canonicalize(working_dir).map_err(|source| ToolError::Io {
        path: working_dir.to_path_buf(),
        source,
    })?;
    let joined = root.join(input);
    let resolved = if joined.exists() {
        std::fs::canonicalize(&joined).map_err(|_| outside())?
    } else {
        let parent = joined.parent().ok_or_else(outside)?;
        let name = joined.file_name().ok_or_else(outside)?;
        std::fs::canonicalize(parent)
            .map_err(|_| outside())?
            .join(name)
    };

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(outside())
    }
}

/// Truncate tool output to at most `max_bytes`, marking the cut.
#[must_use]
pub fn truncate_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let marker = format!("\n\n... [output truncated, {} bytes total]", output.len());
    if max_bytes <= marker.len() {
        let mut end = max_bytes;
        while end > 0 && !marker.is_char_boundary(end) {
            end -= 1;
        }
        return marker[..end].to_string();
    }
    let mut end = max_bytes - marker.len();
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = output;
    truncated.truncate(end);
    truncated.push_str(&marker);
    truncated
}
