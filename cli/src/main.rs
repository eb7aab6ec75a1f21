//! Drover CLI - run one agent task against the current directory.
//!
//! ```text
//! drover [--save-dir DIR | --no-save] [--resume TASK_ID] <task...>
//! ```
//!
//! Configuration comes from `~/.drover/config.toml` with `DROVER_*` environment
//! overrides. Model text streams to stdout, tool activity to stderr, and logs
//! to `~/.drover/logs/drover.log` so neither stream is polluted.

use anyhow::{Context, Result, bail};
use std::{
    env,
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use drover_engine::config::{config_path, drover_dir};
use drover_engine::drover_types::ConversationMessage;
use drover_engine::{
    DiscardTranscript, DroverConfig, HostEnvironmentProbe, InferenceClient, JsonTranscriptSink,
    LoopEvent, LoopState, SessionConfig, TaskSession, ToolLoop, ToolRegistry, TranscriptSink,
    register_builtins, render_system_prompt,
};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Without a log file, stay silent rather than interleave with model output.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.drover/logs/drover.log
    if let Some(dir) = drover_dir() {
        candidates.push(dir.join("logs").join("drover.log"));
    }

    // Fallback: ./.drover-logs/drover.log (useful in constrained environments)
    candidates.push(PathBuf::from(".drover-logs").join("drover.log"));

    candidates
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    task: Option<String>,
    save_dir: Option<PathBuf>,
    no_save: bool,
    resume: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut words = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--save-dir" => {
                let dir = iter.next().context("--save-dir needs a directory")?;
                parsed.save_dir = Some(PathBuf::from(dir));
            }
            "--no-save" => parsed.no_save = true,
            "--resume" => parsed.resume = Some(iter.next().context("--resume needs a task id")?),
            "--" => words.extend(iter.by_ref()),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => words.push(arg),
        }
    }

    if parsed.no_save && parsed.save_dir.is_some() {
        bail!("--no-save and --save-dir are mutually exclusive");
    }
    let task = words.join(" ");
    if !task.trim().is_empty() {
        parsed.task = Some(task);
    }
    if parsed.task.is_none() && parsed.resume.is_none() {
        bail!("usage: drover [--save-dir DIR | --no-save] [--resume TASK_ID] <task...>");
    }
    Ok(parsed)
}

fn transcript_dir(args: &Args) -> Option<PathBuf> {
    if args.no_save {
        return None;
    }
    args.save_dir
        .clone()
        .or_else(|| drover_dir().map(|dir| dir.join("tasks")))
}

/// Print streamed text to stdout and tool activity to stderr.
async fn print_events(mut rx: mpsc::Receiver<LoopEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            LoopEvent::Text(text) => {
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            LoopEvent::ToolStarted { id, name } => eprintln!("\n[{id}] {name} ..."),
            LoopEvent::ToolFinished { id, name, status } => {
                eprintln!("[{id}] {name} {status:?}");
            }
            LoopEvent::StateChanged(_) | LoopEvent::Usage(_) => {}
        }
    }
}

async fn run(args: Args) -> Result<LoopState> {
    let config = DroverConfig::load()?.unwrap_or_default();
    let resolved = config.resolve().with_context(|| match config_path() {
        Some(path) => format!("invalid configuration (file: {})", path.display()),
        None => "invalid configuration".to_string(),
    })?;

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry)?;
    let registry = Arc::new(registry);

    let session_config = SessionConfig {
        model: resolved.model,
        creative_mode: resolved.creative_mode,
        system_prompt: render_system_prompt(&registry),
        custom_instructions: resolved.custom_instructions,
    };

    let dir = transcript_dir(&args);
    let mut session = match (&args.resume, &dir) {
        (Some(task_id), Some(dir)) => {
            let saved = JsonTranscriptSink::new(dir)
                .load(task_id)
                .with_context(|| format!("failed to load task {task_id}"))?;
            let mut messages = saved.messages;
            if let Some(task) = &args.task {
                messages.push(ConversationMessage::user_text(task.clone()));
            }
            TaskSession::resume(session_config, saved.task_id, messages)
        }
        (Some(_), None) => bail!("--resume needs a transcript directory"),
        (None, _) => TaskSession::new(session_config, args.task.clone().unwrap_or_default()),
    };

    let sink: Box<dyn TranscriptSink> = match dir {
        Some(dir) => Box::new(JsonTranscriptSink::new(dir)),
        None => Box::new(DiscardTranscript),
    };

    let working_dir = env::current_dir().context("failed to read the current directory")?;
    let probe = HostEnvironmentProbe::new(working_dir.clone(), vec![working_dir.clone()]);
    let mut settings = resolved.loop_settings;
    settings.working_dir = working_dir;

    let client = InferenceClient::new(resolved.client)?;
    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(rx));
    let tool_loop = ToolLoop::new(client, registry, Box::new(probe), sink, settings).with_events(tx);

    let abort = session.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nAborting...");
            abort.abort();
        }
    });

    tracing::info!(task = %session.id(), model = %session.model(), "Starting task");
    let outcome = tool_loop.run(&mut session).await;
    drop(tool_loop);
    let _ = printer.await;

    let usage = session.usage();
    eprintln!(
        "\n[{}] {} after {} turn(s), {} input / {} output tokens",
        session.id(),
        outcome.state,
        outcome.turns,
        usage.input_tokens,
        usage.output_tokens
    );
    if let Some(err) = outcome.error {
        eprintln!("Error: {err}");
    }
    Ok(outcome.state)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(LoopState::Completed) => ExitCode::SUCCESS,
        Ok(LoopState::Aborted) => ExitCode::from(130),
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
