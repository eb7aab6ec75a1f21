//! Core engine for Drover: the tool execution loop and everything it drives.
//!
//! A [`TaskSession`] owns one conversation. [`ToolLoop`] streams model turns
//! through an [`InferenceTransport`], extracts tool calls as text arrives, runs
//! them against a [`ToolRegistry`] and feeds the results back until the model
//! answers without tools, the task is aborted, or a turn fails.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

pub mod cancel;
pub mod config;
pub mod environment;
pub mod extract;
pub mod persistence;
pub mod prompt;
pub mod session;
pub mod tool_loop;
pub mod tools;

pub use cancel::CancellationController;
pub use config::{ConfigError, DroverConfig, ResolvedConfig};
pub use environment::{
    EnvironmentFut, EnvironmentProbe, HostEnvironmentProbe, NoEnvironment, StaticEnvironment,
};
pub use extract::{Extraction, ToolCallExtractor, ToolParseError};
pub use persistence::{DiscardTranscript, JsonTranscriptSink, SavedTranscript, TranscriptSink};
pub use prompt::render_system_prompt;
pub use session::{SessionConfig, TaskSession};
pub use tool_loop::{LoopError, LoopEvent, LoopOutcome, LoopSettings, LoopState, ToolLoop};
pub use tools::builtins::register_builtins;
pub use tools::{SideEffect, ToolCtx, ToolError, ToolExecutor, ToolParam, ToolRegistry};

pub use drover_providers::{self, ApiError, InferenceClient, InferenceTransport};
pub use drover_types;
