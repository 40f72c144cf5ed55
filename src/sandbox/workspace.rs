//! Per-session workspace provisioning.
//!
//! A workspace is a host directory mounted into the session's container (or
//! used directly in local mode). At creation it receives the agent
//! configuration template; optionally a git working copy on a feature branch
//! named `{base_branch}-{session_id}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{SandboxError, SandboxResult};

/// Clone retry budget for network-class failures.
const CLONE_RETRIES: u32 = 3;
const CLONE_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Provisioner for per-session workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    /// Root under which all workspaces live.
    root: PathBuf,
    /// Read-only agent configuration template copied into new workspaces.
    template_dir: Option<PathBuf>,
    /// Credential injected into clone URLs, never persisted to git config.
    git_token: Option<String>,
}

impl WorkspaceProvisioner {
    /// Create a provisioner. The root and template are process-wide state
    /// established at startup.
    pub fn new(root: PathBuf, template_dir: Option<PathBuf>, git_token: Option<String>) -> Self {
        Self {
            root,
            template_dir,
            git_token,
        }
    }

    /// The workspace path for a session id.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Whether a retained workspace already exists for this session.
    pub fn exists(&self, session_id: &str) -> bool {
        let path = self.path_for(session_id);
        match std::fs::read_dir(&path) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }

    /// Create `{root}/{session_id}` and seed it with the configuration
    /// template. Fails if the directory already exists and is non-empty.
    pub async fn create(&self, session_id: &str) -> SandboxResult<PathBuf> {
        let path = self.path_for(session_id);

        if self.exists(session_id) {
            return Err(SandboxError::Provisioning(format!(
                "workspace already exists and is non-empty: {}",
                path.display()
            )));
        }

        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            SandboxError::Provisioning(format!(
                "creating workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        if let Some(ref template) = self.template_dir {
            if template.is_dir() {
                copy_tree(template.clone(), path.join(".claude"))
                    .await
                    .map_err(|e| {
                        SandboxError::Provisioning(format!("copying agent template: {e:#}"))
                    })?;
                debug!(session_id, "copied agent configuration template");
            } else {
                warn!(
                    template = %template.display(),
                    "configured template directory missing, skipping copy"
                );
            }
        }

        info!(session_id, path = %path.display(), "created workspace");
        Ok(path)
    }

    /// Clone a repository into the workspace and check out the feature
    /// branch `{branch}-{session_id}`.
    ///
    /// The credential is injected into the remote URL for the clone only and
    /// scrubbed before the remote URL lands in the worktree's git config.
    /// Any failure destroys the directory so a partial clone never leaks.
    pub async fn clone_repo(
        &self,
        path: &Path,
        session_id: &str,
        repo_url: &str,
        branch: &str,
    ) -> SandboxResult<()> {
        let result = self
            .clone_inner(path, session_id, repo_url, branch)
            .await;

        if result.is_err() {
            // A partial clone leaves the directory inconsistent
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                warn!(path = %path.display(), error = %e, "failed to clean up partial clone");
            }
        }

        result.map_err(|e| SandboxError::Provisioning(format!("{e:#}")))
    }

    async fn clone_inner(
        &self,
        path: &Path,
        session_id: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<()> {
        let clone_url = self.authenticated_url(repo_url);
        let clone_dir = path.join("repo");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match run_git(
                None,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "-b",
                    branch,
                    &clone_url,
                    &clone_dir.to_string_lossy(),
                ],
            )
            .await
            {
                Ok(_) => break,
                Err(e) => {
                    let message = e.to_string();
                    let retryable = is_network_error(&message);
                    if retryable && attempt < CLONE_RETRIES {
                        warn!(
                            session_id,
                            attempt,
                            error = %redact(&message, self.git_token.as_deref()),
                            "clone failed, retrying"
                        );
                        tokio::time::sleep(CLONE_RETRY_BACKOFF).await;
                        continue;
                    }
                    return Err(anyhow!(
                        "git clone failed: {}",
                        redact(&message, self.git_token.as_deref())
                    ));
                }
            }
        }

        let feature_branch = format!("{}-{}", branch, session_id);
        run_git(Some(&clone_dir), &["checkout", "-b", &feature_branch])
            .await
            .context("creating feature branch")?;

        // Scrub the credential from the persisted remote URL
        if self.git_token.is_some() {
            run_git(Some(&clone_dir), &["remote", "set-url", "origin", repo_url])
                .await
                .context("scrubbing credential from remote URL")?;
        }

        info!(session_id, branch = %feature_branch, "cloned repository");
        Ok(())
    }

    /// Recursively delete a workspace. Called only on explicit session
    /// deletion, never on idle eviction.
    pub async fn destroy(&self, path: &Path) -> SandboxResult<()> {
        if !path.starts_with(&self.root) {
            return Err(SandboxError::Provisioning(format!(
                "refusing to destroy path outside workspace root: {}",
                path.display()
            )));
        }

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "destroyed workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Provisioning(format!(
                "destroying workspace {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn authenticated_url(&self, repo_url: &str) -> String {
        match (&self.git_token, repo_url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://{}@{}", token, rest),
            _ => repo_url.to_string(),
        }
    }
}

async fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.context("spawning git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{}", stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Network-class failures are retried; permission errors are fatal.
fn is_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("could not resolve")
        || lower.contains("connection timed out")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("early eof")
        || lower.contains("rpc failed")
        || lower.contains("unable to access")
}

fn redact(message: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() => message.replace(token, "***"),
        _ => message.to_string(),
    }
}

/// Copy a directory tree. Runs on the blocking pool.
async fn copy_tree(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_tree_sync(&src, &dst))
        .await
        .context("copy task panicked")?
}

fn copy_tree_sync(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("creating directory {}", dst.display()))?;

    for entry in std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree_sync(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
        // Symlinks in the template are skipped; nothing in the agent
        // configuration tree legitimately uses them.
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provisioner(root: &TempDir, template: Option<PathBuf>) -> WorkspaceProvisioner {
        WorkspaceProvisioner::new(root.path().to_path_buf(), template, None)
    }

    #[tokio::test]
    async fn test_create_workspace() {
        let root = TempDir::new().unwrap();
        let ws = provisioner(&root, None);

        let path = ws.create("s1").await.unwrap();
        assert!(path.is_dir());
        assert_eq!(path, root.path().join("s1"));
    }

    #[tokio::test]
    async fn test_create_fails_on_non_empty_dir() {
        let root = TempDir::new().unwrap();
        let existing = root.path().join("s1");
        std::fs::create_dir_all(&existing).unwrap();
        std::fs::write(existing.join("keep.txt"), "retained").unwrap();

        let ws = provisioner(&root, None);
        let err = ws.create("s1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_create_copies_template() {
        let root = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        std::fs::create_dir_all(template.path().join("commands")).unwrap();
        std::fs::write(
            template.path().join("commands/prd-decompose.md"),
            "decompose the PRD",
        )
        .unwrap();
        std::fs::write(template.path().join("settings.json"), "{}").unwrap();

        let ws = provisioner(&root, Some(template.path().to_path_buf()));
        let path = ws.create("s2").await.unwrap();

        assert!(path.join(".claude/settings.json").is_file());
        let body =
            std::fs::read_to_string(path.join(".claude/commands/prd-decompose.md")).unwrap();
        assert_eq!(body, "decompose the PRD");
    }

    #[tokio::test]
    async fn test_exists_detects_retained_workspace() {
        let root = TempDir::new().unwrap();
        let ws = provisioner(&root, None);
        assert!(!ws.exists("s3"));

        let path = root.path().join("s3");
        std::fs::create_dir_all(&path).unwrap();
        // Empty dir does not count as retained
        assert!(!ws.exists("s3"));

        std::fs::write(path.join("file"), "x").unwrap();
        assert!(ws.exists("s3"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_scoped() {
        let root = TempDir::new().unwrap();
        let ws = provisioner(&root, None);
        let path = ws.create("s4").await.unwrap();

        ws.destroy(&path).await.unwrap();
        assert!(!path.exists());
        // Second destroy is a no-op
        ws.destroy(&path).await.unwrap();

        // Paths outside the root are refused
        let outside = TempDir::new().unwrap();
        assert!(ws.destroy(outside.path()).await.is_err());
    }

    #[test]
    fn test_authenticated_url_injection() {
        let root = TempDir::new().unwrap();
        let ws = WorkspaceProvisioner::new(
            root.path().to_path_buf(),
            None,
            Some("tok123".to_string()),
        );
        assert_eq!(
            ws.authenticated_url("https://git.example/x.git"),
            "https://tok123@git.example/x.git"
        );
        // Non-https URLs are left alone
        assert_eq!(
            ws.authenticated_url("git@git.example:x.git"),
            "git@git.example:x.git"
        );
    }

    #[test]
    fn test_network_error_classification() {
        assert!(is_network_error("fatal: unable to access 'https://x': timeout"));
        assert!(is_network_error("Could not resolve host: git.example"));
        assert!(!is_network_error("fatal: Permission denied (publickey)"));
    }

    #[test]
    fn test_redact_hides_token() {
        let redacted = redact("https://tok123@git.example failed", Some("tok123"));
        assert!(!redacted.contains("tok123"));
        assert!(redacted.contains("***"));
    }
}
