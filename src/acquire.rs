//! Repository acquisition with the `git` CLI.
//!
//! Each remote gets a stable working-copy directory under `repos_dir`,
//! named from the last URL segment plus a short URL hash so two forks with
//! the same name never collide. The first ingestion clones; later ones
//! synchronize the existing copy in place.
//!
//! A failed clone removes whatever it created. A failed synchronization
//! aborts the run and leaves the copy as it was.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::GitConfig;
use crate::error::{RagError, Result};

/// Produces a local directory holding a repository's files.
#[async_trait]
pub trait RepoAcquirer: Send + Sync {
    /// Clone or update `url` and return the working-copy root.
    async fn acquire(&self, url: &str) -> Result<PathBuf>;
}

/// Human-readable repository name: the last path segment without `.git`.
pub fn repo_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':', '\\'])
        .next()
        .unwrap_or(trimmed);
    let name: String = last
        .trim_end_matches(".git")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "repo".to_string()
    } else {
        name
    }
}

/// Directory name of the working copy for `url`.
pub fn working_copy_name(url: &str) -> String {
    format!("{}-{}", repo_name(url), short_hash(url.trim()))
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// Acquirer backed by the system `git` binary.
pub struct GitAcquirer {
    repos_dir: PathBuf,
    branch: Option<String>,
    shallow: bool,
    timeout: Duration,
}

impl GitAcquirer {
    pub fn new(repos_dir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            branch: config.branch.clone(),
            shallow: config.shallow,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn working_copy_path(&self, url: &str) -> PathBuf {
        self.repos_dir.join(working_copy_name(url))
    }

    async fn clone_into(&self, url: &str, dest: &Path) -> Result<()> {
        let mut args: Vec<String> = vec!["clone".into()];
        if let Some(branch) = &self.branch {
            args.extend(["--branch".into(), branch.clone(), "--single-branch".into()]);
        }
        if self.shallow {
            args.extend(["--depth".into(), "1".into()]);
        }
        args.push(url.to_string());
        args.push(dest.display().to_string());

        run_git(&args, None, "git clone", self.timeout).await
    }

    async fn sync(&self, dir: &Path) -> Result<()> {
        match &self.branch {
            Some(branch) => {
                run_git(
                    &["fetch".into(), "origin".into(), branch.clone()],
                    Some(dir),
                    "git fetch",
                    self.timeout,
                )
                .await?;
                run_git(
                    &["reset".into(), "--hard".into(), format!("origin/{}", branch)],
                    Some(dir),
                    "git reset",
                    self.timeout,
                )
                .await
            }
            None => {
                run_git(
                    &["pull".into(), "--ff-only".into()],
                    Some(dir),
                    "git pull",
                    self.timeout,
                )
                .await
            }
        }
    }
}

#[async_trait]
impl RepoAcquirer for GitAcquirer {
    async fn acquire(&self, url: &str) -> Result<PathBuf> {
        let url = url.trim();
        if url.is_empty() {
            return Err(RagError::Acquisition("repository URL is empty".to_string()));
        }
        let dest = self.working_copy_path(url);

        if dest.join(".git").is_dir() {
            tracing::info!(url, path = %dest.display(), "updating working copy");
            self.sync(&dest).await?;
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.repos_dir).await.map_err(|e| {
            RagError::Acquisition(format!(
                "failed to create {}: {}",
                self.repos_dir.display(),
                e
            ))
        })?;
        if dest.exists() {
            // Leftover from an interrupted run, not a usable checkout.
            let _ = tokio::fs::remove_dir_all(&dest).await;
        }

        tracing::info!(url, path = %dest.display(), "cloning repository");
        if let Err(e) = self.clone_into(url, &dest).await {
            let _ = tokio::fs::remove_dir_all(&dest).await;
            return Err(e);
        }
        Ok(dest)
    }
}

async fn run_git(
    args: &[String],
    cwd: Option<&Path>,
    operation: &'static str,
    timeout: Duration,
) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(|e| {
            RagError::Acquisition(format!("failed to execute git ({}). Is git installed?", e))
        })?,
        Err(_) => {
            tracing::warn!(operation, secs = timeout.as_secs(), "git timed out");
            return Err(RagError::Timeout {
                operation,
                after: timeout,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RagError::Acquisition(format!(
            "{} failed: {}",
            operation,
            stderr.trim()
        )));
    }
    Ok(())
}
