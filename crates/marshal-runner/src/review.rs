//! Review requests (pull requests) behind the open/comment/merge steps.
//!
//! The default provider drives GitHub through the `gh` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use marshal_core::config::MergeStrategy;
use marshal_core::task::ReviewRequestRef;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewState {
    Open,
    Merged,
    Closed,
}

/// An external review-request system.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// The open request whose head is `branch`, if any.
    async fn find_open(&self, branch: &str) -> Result<Option<ReviewRequestRef>>;

    async fn open(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ReviewRequestRef>;

    /// Bodies of all comments on the request.
    async fn comments(&self, number: u64) -> Result<Vec<String>>;

    async fn comment(&self, number: u64, body: &str) -> Result<()>;

    async fn state(&self, number: u64) -> Result<ReviewState>;

    async fn merge(&self, number: u64, strategy: MergeStrategy, delete_branch: bool) -> Result<()>;
}

/// GitHub pull requests via `gh`.
pub struct GhReviewProvider {
    repo_dir: PathBuf,
}

impl GhReviewProvider {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context(format!("failed to run `gh {}`", args[..2.min(args.len())].join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GhPr {
    number: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct GhComments {
    comments: Vec<GhComment>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    body: String,
}

#[derive(Debug, Deserialize)]
struct GhState {
    state: ReviewState,
}

/// `https://github.com/org/repo/pull/42` → 42.
fn parse_pr_url(url: &str) -> Option<u64> {
    url.trim().trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[async_trait]
impl ReviewProvider for GhReviewProvider {
    async fn find_open(&self, branch: &str) -> Result<Option<ReviewRequestRef>> {
        let out = self
            .gh(&["pr", "list", "--head", branch, "--state", "open", "--json", "number,url"])
            .await?;
        let prs: Vec<GhPr> =
            serde_json::from_str(&out).context("failed to parse gh pr list output")?;
        Ok(prs.into_iter().next().map(|pr| ReviewRequestRef {
            number: pr.number,
            url: pr.url,
        }))
    }

    async fn open(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ReviewRequestRef> {
        let url = self
            .gh(&[
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ])
            .await?;
        let number = parse_pr_url(&url).context(format!("unexpected gh pr create output: {url}"))?;
        Ok(ReviewRequestRef { number, url })
    }

    async fn comments(&self, number: u64) -> Result<Vec<String>> {
        let out = self
            .gh(&["pr", "view", &number.to_string(), "--json", "comments"])
            .await?;
        let parsed: GhComments =
            serde_json::from_str(&out).context("failed to parse gh pr view output")?;
        Ok(parsed.comments.into_iter().map(|c| c.body).collect())
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.gh(&["pr", "comment", &number.to_string(), "--body", body])
            .await?;
        Ok(())
    }

    async fn state(&self, number: u64) -> Result<ReviewState> {
        let out = self
            .gh(&["pr", "view", &number.to_string(), "--json", "state"])
            .await?;
        let parsed: GhState =
            serde_json::from_str(&out).context("failed to parse gh pr view output")?;
        Ok(parsed.state)
    }

    async fn merge(&self, number: u64, strategy: MergeStrategy, delete_branch: bool) -> Result<()> {
        let number = number.to_string();
        let mut args = vec!["pr", "merge", number.as_str(), strategy.gh_flag()];
        if delete_branch {
            args.push("--delete-branch");
        }
        self.gh(&args).await?;
        Ok(())
    }
}
