//! Callgate - run page script against the privileged call bridge.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use callgate::{ExtensionHost, HostConfig, TerminalPrompt};
use callgate_security::{AutoPrompt, ConsentPrompt, PromptOutcome};
use telephony::SimulatedEngine;

/// How consent prompts are answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Answer {
    /// Ask on the terminal.
    Ask,
    Accept,
    Decline,
    Dismiss,
}

/// Load a page and run its script against a simulated telephony engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the page the script runs in
    url: String,

    /// Script to run in the page
    script: PathBuf,

    /// JSON preference file (allow-list lives here)
    #[arg(long)]
    prefs: Option<PathBuf>,

    /// JSON permission file (per-origin decisions)
    #[arg(long)]
    permissions: Option<PathBuf>,

    /// How to answer consent prompts
    #[arg(long, value_enum, default_value = "ask")]
    answer: Answer,

    /// Image returned by fetchImage(true)
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Expression to print as JSON once the script is idle
    #[arg(long)]
    print: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Callgate v{}", callgate::VERSION);

    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("reading {}", args.script.display()))?;

    let mut config = HostConfig::default();
    if let Some(path) = &args.prefs {
        config = config.with_prefs_path(path);
    }
    if let Some(path) = &args.permissions {
        config = config.with_permissions_path(path);
    }

    let prompt: Arc<dyn ConsentPrompt> = match args.answer {
        Answer::Ask => Arc::new(TerminalPrompt::stdin()),
        Answer::Accept => Arc::new(AutoPrompt::new(PromptOutcome::Accept)),
        Answer::Decline => Arc::new(AutoPrompt::new(PromptOutcome::Decline)),
        Answer::Dismiss => Arc::new(AutoPrompt::new(PromptOutcome::Dismissed)),
    };

    let mut engine = SimulatedEngine::new();
    if let Some(path) = &args.snapshot {
        engine = engine.with_snapshot(path);
    }
    let engine = Arc::new(engine);

    let mut host = ExtensionHost::new(config, prompt, engine.clone())?;
    let Some(page) = host.on_document_created(&args.url)? else {
        bail!("call API was not injected into {}", args.url);
    };

    host.run_script(page, &source).await?;

    if let Some(expression) = &args.print {
        if let Some(page_context) = host.page_mut(page) {
            println!("{}", page_context.eval_json(expression)?);
        }
    }

    info!(
        "Session {:?}, call {}, {} engine invocations",
        host.session().status(),
        host.session().call_state(),
        engine.calls().len()
    );

    host.on_document_destroyed(page);
    host.shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_minimal() {
        let args = Args::parse_from(["callgate", "http://localhost", "call.js"]);
        assert_eq!(args.url, "http://localhost");
        assert_eq!(args.script, PathBuf::from("call.js"));
        assert_eq!(args.answer, Answer::Ask);
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_full() {
        let args = Args::parse_from([
            "callgate",
            "https://phone.example",
            "call.js",
            "--prefs",
            "prefs.json",
            "--answer",
            "decline",
            "--print",
            "result",
            "-v",
        ]);
        assert_eq!(args.prefs, Some(PathBuf::from("prefs.json")));
        assert_eq!(args.answer, Answer::Decline);
        assert_eq!(args.print.as_deref(), Some("result"));
        assert!(args.verbose);
    }
}
