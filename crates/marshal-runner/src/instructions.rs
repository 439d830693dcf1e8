//! Worker instructions rendered into the task's runtime directory.

use anyhow::{Context, Result};
use marshal_core::role::RoleName;
use marshal_core::task::Task;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const INSTRUCTIONS_FILE: &str = "instructions.md";
pub const RESULT_FILE: &str = "result.json";
pub const LOG_FILE: &str = "worker.log";

/// Render the instructions a worker of `role` receives for `task`.
///
/// The most recent rejection feedback is included verbatim.
pub fn render(task: &Task, role: &RoleName, workspace: &Path, result_path: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}: {}", task.id, task.title);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Role: {role}");
    let _ = writeln!(out, "- Queue: {}", task.queue);
    let _ = writeln!(out, "- Branch: {} (base {})", task.branch_name(), task.base_branch);
    let _ = writeln!(out, "- Workspace: {}", workspace.display());
    if let Some(review) = &task.review_request {
        let _ = writeln!(out, "- Review request: #{} {}", review.number, review.url);
    }
    let _ = writeln!(out);

    if !task.description.trim().is_empty() {
        let _ = writeln!(out, "## Description");
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", task.description.trim_end());
        let _ = writeln!(out);
    }

    if let Some(feedback) = &task.last_feedback {
        let _ = writeln!(out, "## Previous review feedback");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "This task was rejected {} time(s). The latest feedback:",
            task.rejection_count
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "{feedback}");
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Result");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "When you stop, write a JSON object to `{}`:",
        result_path.display()
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "`{{\"outcome\": \"success\" | \"failure\" | \"needs_continuation\", \"decision\": \"approve\" | \"reject\", \"comment\": \"...\"}}`"
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "`decision` is only for reviewing roles. Commit your work on the branch before finishing."
    );
    out
}

/// Write instructions into `dir`, returning the file path.
pub fn write(
    dir: &Path,
    task: &Task,
    role: &RoleName,
    workspace: &Path,
    result_path: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).context(format!("failed to create {}", dir.display()))?;
    let path = dir.join(INSTRUCTIONS_FILE);
    std::fs::write(&path, render(task, role, workspace, result_path))
        .context(format!("failed to write {}", path.display()))?;
    Ok(path)
}
