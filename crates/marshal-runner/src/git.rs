//! Git access: libgit2 for reads, the `git` CLI for worktree and network
//! operations.

use anyhow::{Context, Result};
use git2::{BranchType, Oid, Repository};
use std::path::Path;
use std::process::Command;

/// Read-only queries against a repository using libgit2.
pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    /// Open an existing repository (or a worktree of one).
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .context(format!("failed to open git repo at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit SHA.
    pub fn head_sha(&self) -> Result<String> {
        let head = self.repo.head()?;
        let oid = head.target().context("HEAD has no target")?;
        Ok(oid.to_string())
    }

    /// Tip of a local branch, if it exists.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        match self.repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Ok(b.get().target().map(|oid| oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("failed to look up branch {branch}")),
        }
    }

    /// Tip of `<remote>/<branch>` as last fetched.
    pub fn remote_tip(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let name = format!("{remote}/{branch}");
        match self.repo.find_branch(&name, BranchType::Remote) {
            Ok(b) => Ok(b.get().target().map(|oid| oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("failed to look up remote branch {name}")),
        }
    }

    pub fn has_remote(&self, remote: &str) -> bool {
        self.repo.find_remote(remote).is_ok()
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let a = Oid::from_str(ancestor)?;
        let d = Oid::from_str(descendant)?;
        if a == d {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(d, a)?)
    }

    /// Number of commits on `branch` that are not reachable from `since`.
    ///
    /// With no `since`, counts the whole history of the branch.
    pub fn commits_since(&self, branch: &str, since: Option<&str>) -> Result<usize> {
        let Some(tip) = self.branch_tip(branch)? else {
            return Ok(0);
        };
        let mut walk = self.repo.revwalk()?;
        walk.push(Oid::from_str(&tip)?)?;
        if let Some(since) = since {
            walk.hide(Oid::from_str(since)?)?;
        }
        let mut count = 0;
        for oid in walk {
            oid?;
            count += 1;
        }
        Ok(count)
    }
}

/// Run `git <args>` in `cwd`, returning trimmed stdout. Fails on non-zero exit.
pub fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .context(format!("failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: std::path::PathBuf,
    pub head: Option<String>,
    /// Checked-out branch (short name); `None` when detached.
    pub branch: Option<String>,
}

pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: path.into(),
                head: None,
                branch: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(sha) = line.strip_prefix("HEAD ") {
                entry.head = Some(sha.to_string());
            } else if let Some(r) = line.strip_prefix("branch ") {
                entry.branch = Some(r.strip_prefix("refs/heads/").unwrap_or(r).to_string());
            }
        }
    }
    entries.extend(current);
    entries
}


#[cfg(test)]
mod tests {
    use super::test_support::TestRepo;
    use super::*;

    #[test]
    fn parses_porcelain_worktree_list() {
        let text = "worktree /repo\nHEAD aaaa\nbranch refs/heads/main\n\n\
                    worktree /wt/task-0001\nHEAD bbbb\ndetached\n\n\
                    worktree /wt/project-0002\nHEAD cccc\nbranch refs/heads/proj/x\n";
        let entries = parse_worktree_list(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch, None);
        assert_eq!(entries[1].head.as_deref(), Some("bbbb"));
        assert_eq!(entries[2].branch.as_deref(), Some("proj/x"));
    }

    #[test]
    fn branch_tips_and_ancestry() {
        let t = TestRepo::new();
        let base = git(&t.repo, &["rev-parse", "HEAD"]).unwrap();
        git(&t.repo, &["checkout", "-b", "feature"]).unwrap();
        let tip = TestRepo::commit_file(&t.repo, "a.txt", "a");

        let repo = GitRepo::open(&t.repo).unwrap();
        assert_eq!(repo.branch_tip("feature").unwrap(), Some(tip.clone()));
        assert_eq!(repo.branch_tip("missing").unwrap(), None);
        assert_eq!(repo.remote_tip("origin", "main").unwrap(), Some(base.clone()));
        assert_eq!(repo.remote_tip("origin", "feature").unwrap(), None);
        assert!(repo.is_ancestor(&base, &tip).unwrap());
        assert!(!repo.is_ancestor(&tip, &base).unwrap());
        assert_eq!(repo.commits_since("feature", Some(&base)).unwrap(), 1);
        assert!(repo.has_remote("origin"));
        assert!(!repo.has_remote("upstream"));
    }

    #[test]
    fn git_cli_errors_carry_stderr() {
        let t = TestRepo::new();
        let err = git(&t.repo, &["checkout", "no-such-branch"]).unwrap_err();
        assert!(err.to_string().contains("git checkout no-such-branch failed"));
    }
}
