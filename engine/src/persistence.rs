//! Transcript persistence at the loop's terminal states.

use std::io;
use std::path::{Path, PathBuf};

use drover_types::ConversationMessage;
use serde::{Deserialize, Serialize};

use crate::tool_loop::LoopState;

/// Receives the transcript whenever a task reaches a terminal state.
pub trait TranscriptSink: Send + Sync {
    fn persist(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
        state: LoopState,
    ) -> io::Result<()>;
}

impl<S: TranscriptSink + ?Sized> TranscriptSink for std::sync::Arc<S> {
    fn persist(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
        state: LoopState,
    ) -> io::Result<()> {
        (**self).persist(task_id, messages, state)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardTranscript;

impl TranscriptSink for DiscardTranscript {
    fn persist(&self, _: &str, _: &[ConversationMessage], _: LoopState) -> io::Result<()> {
        Ok(())
    }
}

/// On-disk form of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTranscript {
    pub task_id: String,
    pub state: LoopState,
    pub saved_at: chrono::DateTime<chrono::Utc>,
    pub messages: Vec<ConversationMessage>,
}

/// Writes `{task_id}.json` into a private directory, replacing earlier saves.
#[derive(Debug, Clone)]
pub struct JsonTranscriptSink {
    dir: PathBuf,
}

impl JsonTranscriptSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn load(&self, task_id: &str) -> io::Result<SavedTranscript> {
        let bytes = std::fs::read(self.path_for(task_id))?;
        serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl TranscriptSink for JsonTranscriptSink {
    fn persist(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
        state: LoopState,
    ) -> io::Result<()> {
        if task_id.is_empty() || task_id.contains(['/', '\\']) || task_id.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid task id {task_id:?}"),
            ));
        }
        ensure_secure_dir(&self.dir)?;
        let record = SavedTranscript {
            task_id: task_id.to_string(),
            state,
            saved_at: chrono::Utc::now(),
            messages: messages.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        let path = self.path_for(task_id);
        let mut tmp = tempfile::Builder::new()
            .prefix(".transcript-")
            .tempfile_in(&self.dir)?;
        io::Write::write_all(&mut tmp, &json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        tracing::debug!(path = %path.display(), ?state, messages = messages.len(), "Transcript saved");
        Ok(())
    }
}

/// Create `path` if needed; a directory created here is private to the user.
pub(crate) fn ensure_secure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
