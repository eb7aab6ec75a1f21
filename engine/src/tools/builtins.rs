//! Built-in tool executors.
//!
//! Every path parameter is confined to the invocation's working directory.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use super::{
    SideEffect, ToolCtx, ToolError, ToolExecutor, ToolFut, ToolParam, ToolRegistry, confine_path,
    required_str,
};

const MAX_LISTED_ENTRIES: usize = 500;
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Default)]
pub struct ReadFileTool;

#[derive(Debug, Default)]
pub struct ListFilesTool;

#[derive(Debug, Default)]
pub struct WriteFileTool;

fn failed(tool: &str, message: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        tool: tool.to_string(),
        message: message.to_string(),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ToolError + '_ {
    move |source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(tool: &'static str, work: F) -> Result<T, ToolError>
where
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| failed(tool, e))?
}

impl ToolExecutor for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a text file relative to the working directory."
    }

    fn parameters(&self) -> &[ToolParam] {
        const PARAMS: &[ToolParam] = &[ToolParam::required(
            "path",
            "File path relative to the working directory",
        )];
        PARAMS
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::ReadOnly
    }

    fn execute(&self, input: Value, ctx: ToolCtx) -> ToolFut<'_> {
        Box::pin(async move {
            let path = required_str(&input, "path")?.to_string();
            let resolved = confine_path(&path, &ctx.working_dir)?;
            blocking("read_file", move || read_text(&resolved)).await
        })
    }
}

fn read_text(path: &Path) -> Result<String, ToolError> {
    let meta = std::fs::metadata(path).map_err(io_error(path))?;
    if meta.is_dir() {
        return Err(failed("read_file", "path is a directory"));
    }
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut file| file.read_to_end(&mut bytes))
        .map_err(io_error(path))?;
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if head.contains(&0) {
        return Err(failed("read_file", "binary file"));
    }
    String::from_utf8(bytes).map_err(|_| failed("read_file", "file is not valid UTF-8"))
}

impl ToolExecutor for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List files in a directory relative to the working directory. Directories end with '/'."
    }

    fn parameters(&self) -> &[ToolParam] {
        const PARAMS: &[ToolParam] = &[
            ToolParam::required("path", "Directory path relative to the working directory"),
            ToolParam::optional("recursive", "'true' to list nested directories"),
        ];
        PARAMS
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::ReadOnly
    }

    fn execute(&self, input: Value, ctx: ToolCtx) -> ToolFut<'_> {
        Box::pin(async move {
            let path = required_str(&input, "path")?.to_string();
            let recursive = input
                .get("recursive")
                .and_then(Value::as_str)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
            let resolved = confine_path(&path, &ctx.working_dir)?;
            let cancel = ctx.cancel.clone();
            blocking("list_files", move || {
                let mut entries = Vec::new();
                let truncated = walk(&resolved, &resolved, recursive, &mut entries, &|| {
                    cancel.is_cancelled()
                })?;
                if cancel.is_cancelled() {
                    return Err(ToolError::Cancelled {
                        tool: "list_files".to_string(),
                    });
                }
                entries.sort();
                let mut output = if entries.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    entries.join("\n")
                };
                if truncated {
                    output.push_str(&format!("\n... [listing stopped at {MAX_LISTED_ENTRIES} entries]"));
                }
                Ok(output)
            })
            .await
        })
    }
}

/// Collect entries below `dir`, relative to `root`. Returns true when the cap was hit.
fn walk(
    root: &Path,
    dir: &Path,
    recursive: bool,
    entries: &mut Vec<String>,
    cancelled: &dyn Fn() -> bool,
) -> Result<bool, ToolError> {
    let meta = std::fs::metadata(dir).map_err(io_error(dir))?;
    if !meta.is_dir() {
        return Err(failed("list_files", "path is not a directory"));
    }
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    children.sort();

    for child in children {
        if entries.len() >= MAX_LISTED_ENTRIES || cancelled() {
            return Ok(entries.len() >= MAX_LISTED_ENTRIES);
        }
        let relative = child.strip_prefix(root).unwrap_or(&child);
        // symlink_metadata keeps the walk from following links out of the tree
        let is_dir = std::fs::symlink_metadata(&child).is_ok_and(|m| m.is_dir());
        let display = relative.to_string_lossy().replace('\\', "/");
        if is_dir {
            entries.push(format!("{display}/"));
            if recursive && walk(root, &child, true, entries, cancelled)? {
                return Ok(true);
            }
        } else {
            entries.push(display);
        }
    }
    Ok(false)
}

impl ToolExecutor for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_to_file"
    }

    fn description(&self) -> &'static str {
        "Write content to a file relative to the working directory, replacing it if it exists \
         and creating missing parent directories."
    }

    fn parameters(&self) -> &[ToolParam] {
        const PARAMS: &[ToolParam] = &[
            ToolParam::required("path", "File path relative to the working directory"),
            ToolParam::required("content", "Complete new file content"),
        ];
        PARAMS
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::Mutating
    }

    fn fail_fast(&self) -> bool {
        true
    }

    fn execute(&self, input: Value, ctx: ToolCtx) -> ToolFut<'_> {
        Box::pin(async move {
            let path = required_str(&input, "path")?.to_string();
            let content = required_str(&input, "content")?.to_string();
            let (target, working_dir) = (path.clone(), ctx.working_dir.clone());
            blocking("write_to_file", move || create_parent_dirs(&target, &working_dir)).await?;
            let resolved = confine_path(&path, &ctx.working_dir)?;
            if ctx.cancel.is_cancelled() {
                return Err(ToolError::Cancelled {
                    tool: "write_to_file".to_string(),
                });
            }
            let len = content.len();
            blocking("write_to_file", move || write_atomic(&resolved, content.as_bytes())).await?;
            Ok(format!("Wrote {len} bytes to {path}"))
        })
    }
}

/// Create the missing parents of `path`, refusing when an existing ancestor
/// resolves outside the working directory. Nothing is created for a path that
/// is absolute or climbs with `..`.
fn create_parent_dirs(path: &str, working_dir: &Path) -> Result<(), ToolError> {
    let relative = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !relative {
        return Err(ToolError::BadArgs {
            message: format!("path '{path}' is outside the working directory"),
        });
    }
    let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let target = working_dir.join(parent);
    if target.exists() {
        return Ok(());
    }
    let mut ancestor = target.as_path();
    while !ancestor.exists() {
        ancestor = match ancestor.parent() {
            Some(next) => next,
            None => return Ok(()),
        };
    }
    let root = std::fs::canonicalize(working_dir).map_err(io_error(working_dir))?;
    let existing = std::fs::canonicalize(ancestor).map_err(io_error(ancestor))?;
    if !existing.starts_with(&root) {
        return Err(ToolError::BadArgs {
            message: format!("path '{path}' is outside the working directory"),
        });
    }
    std::fs::create_dir_all(&target).map_err(io_error(&target))
}

/// Replace `path` through a temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ToolError> {
    let parent = path
        .parent()
        .ok_or_else(|| failed("write_to_file", "path has no parent directory"))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".drover-write-")
        .tempfile_in(parent)
        .map_err(io_error(parent))?;
    temp.write_all(bytes)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(io_error(path))?;
    temp.persist(path).map_err(|e| ToolError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Register built-in tools into the registry.
pub fn register_builtins(registry: &mut ToolRegistry) -> Result<(), ToolError> {
    registry.register(Box::new(ReadFileTool))?;
    registry.register(Box::new(ListFilesTool))?;
    registry.register(Box::new(WriteFileTool))?;
    Ok(())
}
