use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone `url` at `base_branch` into `dest`.
    async fn clone_repo(&self, url: &str, dest: &Path, base_branch: &str) -> Result<()>;

    async fn create_branch(&self, repo_dir: &Path, branch: &str) -> Result<()>;

    async fn push_branch(&self, repo_dir: &Path, branch: &str) -> Result<()>;

    /// Fetch and rebase onto `origin/<base>`. A failed rebase is aborted so the
    /// working copy is left as it was.
    async fn rebase_onto(&self, repo_dir: &Path, base_branch: &str) -> Result<()>;

    /// Fetch and merge `origin/<base>`. A failed merge is aborted.
    async fn merge_from(&self, repo_dir: &Path, base_branch: &str) -> Result<()>;
}

/// [`GitOps`] backed by the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    /// Run git in `dir` and fail with its stderr on a non-zero exit.
    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn fetch(&self, repo_dir: &Path, base_branch: &str) -> Result<()> {
        self.run(Some(repo_dir), &["fetch", "origin", base_branch]).await?;
        Ok(())
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path, base_branch: &str) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        // `url` may carry a token; keep it out of logs and errors.
        self.run(None, &["clone", "--branch", base_branch, url, &dest_str])
            .await
            .map_err(|_| anyhow::anyhow!("Failed to clone repository into {}", dest.display()))?;
        debug!(dest = %dest.display(), base_branch, "Cloned repository");
        Ok(())
    }

    async fn create_branch(&self, repo_dir: &Path, branch: &str) -> Result<()> {
        self.run(Some(repo_dir), &["checkout", "-b", branch])
            .await
            .with_context(|| format!("Failed to create branch {}", branch))?;
        Ok(())
    }

    async fn push_branch(&self, repo_dir: &Path, branch: &str) -> Result<()> {
        self.run(
            Some(repo_dir),
            &["push", "--force-with-lease", "-u", "origin", branch],
        )
        .await
        .with_context(|| format!("Failed to push branch {}", branch))?;
        Ok(())
    }

    async fn rebase_onto(&self, repo_dir: &Path, base_branch: &str) -> Result<()> {
        self.fetch(repo_dir, base_branch).await?;
        let upstream = format!("origin/{}", base_branch);
        if let Err(e) = self.run(Some(repo_dir), &["rebase", &upstream]).await {
            if let Err(abort) = self.run(Some(repo_dir), &["rebase", "--abort"]).await {
                warn!(error = %abort, "git rebase --abort failed");
            }
            return Err(e.context(format!("Failed to rebase onto {}", upstream)));
        }
        Ok(())
    }

    async fn merge_from(&self, repo_dir: &Path, base_branch: &str) -> Result<()> {
        self.fetch(repo_dir, base_branch).await?;
        let upstream = format!("origin/{}", base_branch);
        if let Err(e) = self.run(Some(repo_dir), &["merge", "--no-edit", &upstream]).await {
            if let Err(abort) = self.run(Some(repo_dir), &["merge", "--abort"]).await {
                warn!(error = %abort, "git merge --abort failed");
            }
            return Err(e.context(format!("Failed to merge {}", upstream)));
        }
        Ok(())
    }
}
