//! Quire CLI - drives the engine against a running vault server.
//!
//! # Flow
//!
//! ```text
//! main() -> QuireConfig::load() -> Controller::new(HttpDocumentStore, HttpGenerationClient)
//!                                        |
//!                                        v
//!          open_document -> start_* -> next_notices()* -> confirm_preview | discard_preview
//! ```
//!
//! Generated text is written to stdout as it arrives. Logs go to a file so
//! they never interleave with it. Ctrl-C while a generation streams cancels
//! it and leaves the document untouched.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use quire_config::{QuireConfig, config_path};
use quire_engine::quire_providers::retry::RetryConfig;
use quire_engine::quire_providers::{
    HttpDocumentStore, HttpGenerationClient, TreeSource, parse_base_url,
};
use quire_engine::quire_types::{DocKey, TreeNode};
use quire_engine::{Controller, DiffStats, Notice};

#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "AI-assisted editing for a markdown vault")]
struct Cli {
    /// Vault server URL. Overrides the config file and $QUIRE_API_BASE_URL.
    #[arg(long, global = true, value_name = "URL")]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the vault tree
    Tree,
    /// Print a document
    Show { key: String },
    /// Ask a question about a document
    Advise {
        key: String,
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Rewrite a document following an instruction
    Edit {
        key: String,
        #[arg(required = true, num_args = 1..)]
        instruction: Vec<String>,
        /// Apply the result without asking
        #[arg(long, short)]
        yes: bool,
    },
    /// Let the model tidy up a document
    Optimize {
        key: String,
        /// Apply the result without asking
        #[arg(long, short)]
        yes: bool,
    },
}

fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

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

    // No log file: stay silent rather than mix logs into streamed output.
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

        match OpenOptions::new().create(true).append(true).open(&candidate) {
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

    // Primary: ~/.quire/logs/quire.log
    if let Some(path) = config_path()
        && let Some(dir) = path.parent()
    {
        candidates.push(dir.join("logs").join("quire.log"));
    }

    candidates.push(PathBuf::from(".quire").join("logs").join("quire.log"));
    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = QuireConfig::load();
    let fallback = QuireConfig::default();
    let config = match &loaded {
        Ok(Some(config)) => config,
        _ => &fallback,
    };
    init_tracing(config.log_filter().as_deref());
    if let Err(e) = &loaded {
        tracing::warn!(path = %e.path().display(), "Ignoring config: {e}");
        eprintln!("warning: ignoring config: {e}");
    }

    let base_url = config.base_url(cli.server.as_deref());
    let base_url =
        parse_base_url(&base_url).with_context(|| format!("invalid server URL {base_url:?}"))?;
    let retry = RetryConfig::default().with_max_retries(config.max_retries());
    tracing::info!(%base_url, "Using vault server");

    let store = Arc::new(
        HttpDocumentStore::new(base_url.clone())
            .with_timeout(config.request_timeout())
            .with_retry(retry.clone()),
    );
    let backend = Arc::new(HttpGenerationClient::new(base_url).with_retry(retry));
    let mut controller =
        Controller::new(store.clone(), backend).with_markdown_only(config.markdown_only());

    match cli.command {
        Command::Tree => print_tree(store.as_ref()).await,
        Command::Show { key } => show(&mut controller, parse_key(&key)?).await,
        Command::Advise { key, question } => {
            advise(&mut controller, parse_key(&key)?, &question.join(" ")).await
        }
        Command::Edit {
            key,
            instruction,
            yes,
        } => {
            let key = parse_key(&key)?;
            open(&mut controller, &key).await?;
            controller.start_edit(&instruction.join(" "))?;
            review(&mut controller, &key, yes).await
        }
        Command::Optimize { key, yes } => {
            let key = parse_key(&key)?;
            open(&mut controller, &key).await?;
            controller.start_optimize()?;
            review(&mut controller, &key, yes).await
        }
    }
}

fn parse_key(raw: &str) -> Result<DocKey> {
    DocKey::new(raw).with_context(|| format!("invalid document key {raw:?}"))
}

async fn print_tree(source: &dyn TreeSource) -> Result<()> {
    let tree = source.list_tree().await.context("failed to list vault")?;
    let mut out = String::new();
    render_tree(&tree, 0, &mut out);
    let mut stdout = tokio::io::stdout();
    stdout.write_all(out.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

fn render_tree(nodes: &[TreeNode], depth: usize, out: &mut String) {
    for node in nodes {
        let suffix = if node.is_leaf { "" } else { "/" };
        let _ = writeln!(out, "{:indent$}{}{suffix}", "", node.title, indent = depth * 2);
        render_tree(&node.children, depth + 1, out);
    }
}

/// Open `key` and wait until it has loaded.
async fn open(controller: &mut Controller, key: &DocKey) -> Result<()> {
    controller.open_document(key.clone())?;
    while let Some(notices) = controller.next_notices().await {
        for notice in notices {
            if let Notice::LoadFailed { error, .. } = notice {
                return Err(anyhow!(error).context(format!("failed to load {key}")));
            }
        }
    }
    Ok(())
}

async fn show(controller: &mut Controller, key: DocKey) -> Result<()> {
    open(controller, &key).await?;
    let content = controller
        .session(&key)
        .map(|s| s.content().to_string())
        .unwrap_or_default();
    let mut stdout = tokio::io::stdout();
    stdout.write_all(content.as_bytes()).await?;
    if !content.ends_with('\n') {
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn advise(controller: &mut Controller, key: DocKey, question: &str) -> Result<()> {
    controller.open_document(key)?;
    controller.start_advise(question)?;
    let finished = stream_to(controller, tokio::io::stdout()).await?;
    println!();
    if finished == Finished::Cancelled {
        eprintln!("Cancelled.");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Preview(DiffStats),
    Advice,
    Cancelled,
}

/// Forward fragments to `sink` until the generation leaves `generating`.
async fn stream_to<W>(controller: &mut Controller, mut sink: W) -> Result<Finished>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            batch = controller.next_notices() => {
                let Some(batch) = batch else {
                    bail!("generation ended without a result");
                };
                for notice in batch {
                    match notice {
                        Notice::Fragment { text, .. } => {
                            sink.write_all(text.as_bytes()).await?;
                            sink.flush().await?;
                        }
                        Notice::PreviewReady { stats, .. } => return Ok(Finished::Preview(stats)),
                        Notice::AdviceComplete { .. } => return Ok(Finished::Advice),
                        Notice::GenerationFailed { failure, .. } => {
                            bail!("generation failed: {failure}");
                        }
                        Notice::LoadFailed { key, error } => {
                            tracing::warn!(%key, %error, "Document load failed during generation");
                        }
                        _ => {}
                    }
                }
            }
            _ = &mut ctrl_c => {
                controller.cancel_generation();
                return Ok(Finished::Cancelled);
            }
        }
    }
}

/// Stream an edit or optimize run, show the diff, then commit or discard it.
async fn review(controller: &mut Controller, key: &DocKey, yes: bool) -> Result<()> {
    // Progress goes to stderr; stdout gets the diff.
    let stats = match stream_to(controller, tokio::io::stderr()).await? {
        Finished::Preview(stats) => stats,
        Finished::Cancelled => {
            eprintln!("\nCancelled; {key} unchanged.");
            return Ok(());
        }
        Finished::Advice => bail!("expected a preview"),
    };
    eprintln!();

    if stats.is_empty() {
        controller.discard_preview();
        println!("No changes to {key}.");
        return Ok(());
    }

    let diff = controller
        .generation()
        .map(|g| g.preview_diff())
        .unwrap_or_default();
    println!("{diff}");
    println!("{key}: {stats}");

    if !yes && !ask(&format!("Apply changes to {key}? [y/N] ")).await? {
        controller.discard_preview();
        println!("Discarded.");
        return Ok(());
    }

    controller.confirm_preview()?;
    while let Some(notices) = controller.next_notices().await {
        for notice in notices {
            match notice {
                Notice::Committed { .. } => println!("Saved {key}."),
                Notice::CommitFailed { error, .. } => {
                    return Err(anyhow!(error).context(format!("failed to save {key}")));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

async fn ask(prompt: &str) -> Result<bool> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(prompt.as_bytes()).await?;
    stderr.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read answer")?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
