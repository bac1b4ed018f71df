use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const GIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TIMEOUT: Duration = Duration::from_secs(10);

async fn git_in(args: &[&str], dir: &Path, timeout: Duration) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    let out = tokio::time::timeout(timeout, cmd.output()).await.ok()?.ok()?;
    if out.status.success() {
        Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        None
    }
}

/// Current branch of the repo containing `dir`, or None outside a work tree.
pub async fn branch_in(dir: &Path) -> Option<String> {
    git_in(&["rev-parse", "--abbrev-ref", "HEAD"], dir, GIT_TIMEOUT)
        .await
        .filter(|b| !b.is_empty() && b != "HEAD")
}

pub async fn is_repo(dir: &Path) -> bool {
    git_in(&["rev-parse", "--is-inside-work-tree"], dir, GIT_TIMEOUT)
        .await
        .map(|s| s == "true")
        .unwrap_or(false)
}

/// One parsed line of `git log --format=%H|%s|%an|%ai`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitLine {
    pub hash: String,
    pub subject: String,
    pub author: String,
    pub date: String,
}

/// Commits in `repo` newer than `since` (a `git log --since` expression),
/// newest first.
pub async fn log_since(repo: &Path, since: &str) -> Vec<CommitLine> {
    let since_arg = format!("--since={since}");
    let out = git_in(
        &["log", &since_arg, "--format=%H|%s|%an|%ai"],
        repo,
        LOG_TIMEOUT,
    )
    .await;
    match out {
        Some(text) => text.lines().filter_map(parse_commit_line).collect(),
        None => Vec::new(),
    }
}

fn parse_commit_line(line: &str) -> Option<CommitLine> {
    let mut parts = line.splitn(4, '|');
    let hash = parts.next()?.trim();
    if hash.is_empty() {
        return None;
    }
    let subject = parts.next()?.trim();
    let author = parts.next()?.trim();
    let date = parts.next()?.trim();
    Some(CommitLine {
        hash: hash.to_string(),
        subject: subject.to_string(),
        author: author.to_string(),
        date: date.to_string(),
    })
}

/// Repo display name: last path segment of its root directory.
pub fn repo_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
