//! # RepoChat CLI (`repochat`)
//!
//! ## Usage
//!
//! ```bash
//! repochat --config ./config/repochat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repochat ingest <url>` | Clone or update a repository and rebuild the index |
//! | `repochat chat "<question>"` | Answer a question about the indexed code |
//! | `repochat search "<query>"` | Show ranked chunk matches |
//! | `repochat status` | Summary of the persisted index |
//! | `repochat serve` | Start the HTTP server |
//! | `repochat completions <shell>` | Print a shell completion script |

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use repochat::config::{self, BackendKind, Config};
use repochat::engine::{ChatEvent, RagEngine};
use repochat::progress::ProgressMode;
use repochat::server;

const DEFAULT_CONFIG: &str = "./config/repochat.toml";

/// RepoChat: chat with a Git repository's code.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/repochat.example.toml` for every setting.
#[derive(Parser)]
#[command(name = "repochat", version, about = "Ask questions about a Git repository's code")]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update a repository and rebuild the index from it.
    ///
    /// The previous index keeps being served until the new one is written.
    Ingest {
        /// Repository URL (anything `git clone` accepts).
        url: String,

        /// Embedding backend: `local` or `remote`. Defaults to `[embedding].backend`.
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Progress output on stderr: `auto`, `human`, `json`, or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Answer a question about the indexed repository.
    Chat {
        question: String,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Show the chunks closest to a query, without generation.
    Search {
        query: String,

        /// Number of matches. Defaults to `[retrieval].k`.
        #[arg(short)]
        k: Option<usize>,

        /// Print matches as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show what the persisted index contains.
    Status,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print a shell completion script to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "repochat", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(cli.verbose);
    let cfg = resolve_config(cli.config.as_deref())?;
    let engine = Arc::new(RagEngine::from_config(cfg)?);

    match cli.command {
        Commands::Ingest {
            url,
            backend,
            progress,
        } => {
            let mode = ProgressMode::from_flag(&progress).map_err(anyhow::Error::msg)?;
            let reporter = mode.reporter();
            let report = engine
                .ingest_with_progress(&url, backend, reporter.as_ref())
                .await;
            if !report.success {
                anyhow::bail!("ingestion failed: {}", report.message);
            }
            println!(
                "Ingested {}: {} documents, {} chunks",
                report.repository, report.documents, report.chunks
            );
        }
        Commands::Chat { question, stream } => {
            engine.restore_index().await;
            if stream {
                run_chat_stream(&engine, &question).await?;
            } else {
                let answer = engine.chat(&question).await?;
                println!("{}", answer.answer);
                print_sources(&answer.sources);
            }
        }
        Commands::Search { query, k, json } => {
            engine.restore_index().await;
            let hits = engine.search(&query, k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("{}. [{:.3}] {} @ {}", i + 1, hit.score, hit.source, hit.offset);
                    let preview: String = hit.content.chars().take(200).collect();
                    println!("    {}", preview.replace('\n', "\n    "));
                }
            }
        }
        Commands::Status => {
            engine.restore_index().await;
            let status = engine.status();
            let generator = engine.generator_info();
            println!(
                "Generator:  {} {} ({})",
                generator.provider, generator.model, generator.base_url
            );
            if !status.loaded {
                println!("No index loaded. Run `repochat ingest <url>` first.");
            } else {
                println!("Repository: {}", status.repository.unwrap_or_default());
                println!("Documents:  {}", status.documents.unwrap_or_default());
                println!("Chunks:     {}", status.chunks.unwrap_or_default());
                println!("Backend:    {}", status.backend.unwrap_or_default());
                println!("Built at:   {}", status.built_at.unwrap_or_default());
            }
        }
        Commands::Serve => {
            engine.restore_index().await;
            server::run_server(engine).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "repochat=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file. A missing file at the default path falls back to
/// built-in defaults; an explicit `--config` path must exist.
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => config::load_config(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let path = Path::new(DEFAULT_CONFIG);
            if path.exists() {
                config::load_config(path)
            } else {
                tracing::debug!("no config at {}, using defaults", DEFAULT_CONFIG);
                Ok(Config::default())
            }
        }
    }
}

async fn run_chat_stream(engine: &RagEngine, question: &str) -> anyhow::Result<()> {
    let mut events = engine.chat_stream(question).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Sources(s) => sources = s,
            ChatEvent::Token(token) => {
                stdout.write_all(token.as_bytes())?;
                stdout.flush()?;
            }
            ChatEvent::Done => {
                println!();
                print_sources(&sources);
            }
            ChatEvent::Error { code, message } => {
                println!();
                anyhow::bail!("{} ({})", message, code);
            }
        }
    }
    Ok(())
}

fn print_sources(sources: &[String]) {
    if sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for source in sources {
        println!("  - {}", source);
    }
}
