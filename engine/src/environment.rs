//! Per-turn environment details attached to the newest user turn.

use std::fmt::Write;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Local override file looked up in each workspace root.
pub const LOCAL_OVERRIDE_FILE: &str = ".drover";

const MAX_OVERRIDE_BYTES: usize = 16 * 1024;

pub type EnvironmentFut<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Supplies the environment block for the next request, if any.
pub trait EnvironmentProbe: Send + Sync {
    fn environment_details(&self) -> EnvironmentFut<'_>;
}

/// Sends no environment block.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnvironment;

impl EnvironmentProbe for NoEnvironment {
    fn environment_details(&self) -> EnvironmentFut<'_> {
        Box::pin(async { None })
    }
}

/// Sends the same block every turn.
#[derive(Debug, Clone)]
pub struct StaticEnvironment(pub String);

impl EnvironmentProbe for StaticEnvironment {
    fn environment_details(&self) -> EnvironmentFut<'_> {
        Box::pin(async move { Some(self.0.clone()) })
    }
}

/// Queries the host on every call so the date and local overrides stay current.
#[derive(Debug, Clone)]
pub struct HostEnvironmentProbe {
    working_dir: PathBuf,
    workspace_roots: Vec<PathBuf>,
}

impl HostEnvironmentProbe {
    /// `workspace_roots` are searched in order for a local override file;
    /// the working directory is used when the list is empty.
    #[must_use]
    pub fn new(working_dir: PathBuf, workspace_roots: Vec<PathBuf>) -> Self {
        Self {
            working_dir,
            workspace_roots,
        }
    }

    async fn local_override(&self) -> Option<(PathBuf, String)> {
        let roots: &[PathBuf] = if self.workspace_roots.is_empty() {
            std::slice::from_ref(&self.working_dir)
        } else {
            &self.workspace_roots
        };
        for root in roots {
            let path = root.join(LOCAL_OVERRIDE_FILE);
            let is_file = tokio::fs::metadata(&path)
                .await
                .is_ok_and(|meta| meta.is_file());
            if !is_file {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(mut contents) => {
                    if contents.len() > MAX_OVERRIDE_BYTES {
                        let mut end = MAX_OVERRIDE_BYTES;
                        while !contents.is_char_boundary(end) {
                            end -= 1;
                        }
                        contents.truncate(end);
                    }
                    return Some((path, contents));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to read local override: {e}");
                }
            }
        }
        None
    }
}

impl EnvironmentProbe for HostEnvironmentProbe {
    fn environment_details(&self) -> EnvironmentFut<'_> {
        Box::pin(async move {
            let date = chrono::Local::now().format("%Y-%m-%d").to_string();
            let is_git_repo = has_git_ancestor(&self.working_dir).await;
            let local_override = self.local_override().await;
            Some(render(&date, &self.working_dir, is_git_repo, local_override))
        })
    }
}

fn render(
    date: &str,
    working_dir: &Path,
    is_git_repo: bool,
    local_override: Option<(PathBuf, String)>,
) -> String {
    let mut buf = String::with_capacity(256);
    let _ = writeln!(buf, "<environment_details>");
    let _ = writeln!(buf, "Date: {date}");
    let _ = writeln!(
        buf,
        "Platform: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let _ = writeln!(buf, "Working directory: {}", working_dir.display());
    let _ = writeln!(
        buf,
        "Git repository: {}",
        if is_git_repo { "yes" } else { "no" }
    );
    if let Some((path, contents)) = local_override {
        let _ = writeln!(buf);
        let _ = writeln!(buf, "Local overrides ({}):", path.display());
        let _ = writeln!(buf, "{}", contents.trim_end());
    }
    buf.push_str("</environment_details>");
    buf
}

async fn has_git_ancestor(start: &Path) -> bool {
    let mut dir = start.to_path_buf();
    loop {
        if tokio::fs::try_exists(dir.join(".git")).await.unwrap_or(false) {
            return true;
        }
        if !dir.pop() {
            return false;
        }
    }
}
