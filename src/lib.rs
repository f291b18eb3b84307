//! # RepoChat
//!
//! Ask questions about a Git repository's code.
//!
//! RepoChat clones a repository, splits its text files into overlapping
//! chunks, embeds them, and keeps a vector index on disk. Questions are
//! answered by retrieving the closest chunks and handing them to an
//! OpenAI-compatible chat model, either as one response or as a stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  git clone  │──▶│ Load + Chunk │──▶│ Embed + Index│──▶ SQLite file
//! │  / pull     │   │              │   │              │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                      ┌──────────────────────┤
//!                      ▼                      ▼
//!                 ┌──────────┐          ┌──────────┐
//!                 │   CLI    │          │   HTTP   │
//!                 │(repochat)│          │ + SSE    │
//!                 └──────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repochat ingest https://github.com/org/project
//! repochat chat "How is the config loaded?" --stream
//! repochat search "retry backoff" -k 5
//! repochat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy with stable codes |
//! | [`models`] | Core data types |
//! | [`acquire`] | Clone or update working copies |
//! | [`loader`] | Walk a working copy and decode text files |
//! | [`chunk`] | Overlapping character chunking |
//! | [`embedding`] | Local and remote embedding backends |
//! | [`index`] | Vector index and its SQLite persistence |
//! | [`db`] | SQLite connections and schema |
//! | [`retrieve`] | Querying and context assembly |
//! | [`prompt`] | Prompt composition and deep reads |
//! | [`generate`] | Chat-completions generation |
//! | [`engine`] | Ingestion and chat orchestration |
//! | [`progress`] | Ingestion progress reporting |
//! | [`server`] | HTTP server |

pub mod acquire;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generate;
pub mod index;
pub mod loader;
pub mod models;
pub mod progress;
pub mod prompt;
pub mod retrieve;
pub mod server;
