//! Mirror operator
//!
//! Executes one repository's synchronization against local storage by
//! driving the `git` binary: a full `--mirror` clone into a temporary
//! directory swapped into place when the mirror does not exist yet, an
//! update-in-place fetch of all refs when it does. Failures are classified
//! into a closed set of kinds so the dispatcher can decide retry policy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MirrorConfig;
use crate::models::repository;

/// Mirror-specific error with a closed kind set for structured handling.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MirrorError {
    #[serde(flatten)]
    pub kind: MirrorErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MirrorErrorKind {
    /// Credentials rejected by the remote; requires operator intervention
    Auth,
    /// Network or timeout failure; retryable
    Transient,
    /// Remote reports the repository does not exist anymore
    Gone,
    /// Local disk or filesystem failure; retryable but logged loudly
    Storage,
}

impl MirrorError {
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self {
            kind: MirrorErrorKind::Auth,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: MirrorErrorKind::Transient,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn gone<S: Into<String>>(message: S) -> Self {
        Self {
            kind: MirrorErrorKind::Gone,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self {
            kind: MirrorErrorKind::Storage,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the dispatcher may retry this failure within the same job.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            MirrorErrorKind::Transient | MirrorErrorKind::Storage
        )
    }
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MirrorErrorKind::Auth => write!(f, "Authentication failed")?,
            MirrorErrorKind::Transient => write!(f, "Transient error")?,
            MirrorErrorKind::Gone => write!(f, "Repository gone")?,
            MirrorErrorKind::Storage => write!(f, "Storage error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for MirrorError {}

/// What one successful sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Fetched,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Fetched => "fetched",
        }
    }
}

/// Result of one successful mirror synchronization.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Head commit of the default branch after the sync, if resolvable
    pub remote_ref: Option<String>,
    pub action: SyncAction,
}

/// Executes one repository's synchronization.
#[async_trait]
pub trait MirrorOperator: Send + Sync {
    async fn sync(
        &self,
        repository: &repository::Model,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MirrorError>;
}

static AUTH_STDERR: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"authentication failed",
        r"could not read username",
        r"could not read password",
        r"permission denied \(publickey\)",
        r"invalid username or password",
        r"http basic: access denied",
        r"authentication required",
    ])
    .expect("auth stderr patterns compile")
});

static GONE_STDERR: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"repository .* not found",
        r"repository .* does not exist",
        r"could not be found",
        r"does not appear to be a git repository",
        r"no such project",
    ])
    .expect("gone stderr patterns compile")
});

/// Classify a failed git invocation from its stderr.
///
/// Auth phrases win over gone phrases because hosting providers answer
/// unauthenticated requests for private repositories with both. Anything
/// unrecognized is treated as transient so it gets retried.
fn classify_git_failure(context: &str, stderr: &str) -> MirrorError {
    let haystack = stderr.to_lowercase();
    let snippet: String = stderr.chars().take(500).collect();

    if AUTH_STDERR.is_match(&haystack) {
        return MirrorError::auth(format!("{}: {}", context, snippet));
    }
    if GONE_STDERR.is_match(&haystack) {
        return MirrorError::gone(format!("{}: {}", context, snippet));
    }
    MirrorError::transient(format!("{}: {}", context, snippet))
}

/// Mirror operator backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitMirror {
    config: MirrorConfig,
}

impl GitMirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }

    /// Run one git invocation, enforcing the configured timeout and the
    /// cooperative cancellation signal. The child is killed when either
    /// fires; a killed invocation surfaces as transient.
    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<std::process::Output, MirrorError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future must kill the child, otherwise a
            // cancelled sync leaves git running against the mirror.
            .kill_on_drop(true)
            // Never hang on an interactive credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|err| MirrorError::storage(format!("failed to spawn git: {}", err)))?;

        let timeout = Duration::from_secs(self.config.git_timeout_seconds);
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(MirrorError::transient("sync cancelled during git execution"))
            }
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(MirrorError::storage(format!(
                    "failed to collect git output: {}",
                    err
                ))),
                Err(_) => Err(MirrorError::transient(format!(
                    "git {} timed out after {}s",
                    args.first().copied().unwrap_or("invocation"),
                    self.config.git_timeout_seconds
                ))),
            }
        }
    }

    /// Remove temp directories a crashed clone attempt may have left behind.
    fn remove_stale_clones(destination: &Path) {
        let Some(parent) = destination.parent() else {
            return;
        };
        let Some(name) = destination.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let prefix = format!("{}.tmp-", name);

        let Ok(entries) = std::fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            if let Some(entry_name) = entry.file_name().to_str()
                && entry_name.starts_with(&prefix)
            {
                warn!(path = %entry.path().display(), "Removing stale clone directory");
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    /// Full mirror clone into a temp directory, atomically renamed into
    /// place so concurrent readers never observe a half-written mirror.
    async fn clone_mirror(
        &self,
        repository: &repository::Model,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), MirrorError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                MirrorError::storage(format!(
                    "failed to create mirror root {}: {}",
                    parent.display(),
                    err
                ))
            })?;
        }

        Self::remove_stale_clones(destination);

        let temp = PathBuf::from(format!(
            "{}.tmp-{}",
            destination.display(),
            Uuid::new_v4().simple()
        ));
        let temp_display = temp.display().to_string();

        // Whatever happens below, never leave a partial clone unless the
        // rename succeeded and the guard was defused.
        let cleanup = scopeguard::guard(temp.clone(), |path| {
            let _ = std::fs::remove_dir_all(&path);
        });

        let output = self
            .run_git(
                &[
                    "clone",
                    "--mirror",
                    repository.clone_url.as_str(),
                    temp_display.as_str(),
                ],
                None,
                cancel,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure("mirror clone failed", &stderr));
        }

        tokio::fs::rename(&temp, destination).await.map_err(|err| {
            MirrorError::storage(format!(
                "failed to move mirror into place at {}: {}",
                destination.display(),
                err
            ))
        })?;

        // The rename took ownership of the directory.
        let _ = scopeguard::ScopeGuard::into_inner(cleanup);

        info!(
            remote_id = repository.remote_id,
            name = %repository.name,
            path = %destination.display(),
            "Created mirror clone"
        );
        Ok(())
    }

    /// Update-in-place fetch of all refs. Git updates each ref atomically,
    /// so readers of the previous snapshot are never left mid-transition.
    async fn fetch_mirror(
        &self,
        repository: &repository::Model,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), MirrorError> {
        let output = self
            .run_git(
                &["fetch", "--prune", "origin", "+refs/*:refs/*"],
                Some(destination),
                cancel,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure("mirror fetch failed", &stderr));
        }

        debug!(
            remote_id = repository.remote_id,
            name = %repository.name,
            "Updated mirror"
        );
        Ok(())
    }

    /// Resolve the mirror's head commit after a sync. An unresolvable head
    /// (an empty repository) is not an error.
    async fn resolve_head(
        &self,
        repository: &repository::Model,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, MirrorError> {
        let target = repository
            .default_branch
            .as_deref()
            .map(|branch| format!("refs/heads/{}", branch))
            .unwrap_or_else(|| "HEAD".to_string());

        let output = self
            .run_git(
                &["rev-parse", "--verify", target.as_str()],
                Some(destination),
                cancel,
            )
            .await?;

        if output.status.success() {
            let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok((!commit.is_empty()).then_some(commit));
        }

        // Fall back to HEAD when the advertised branch does not exist locally.
        if target != "HEAD" {
            let output = self
                .run_git(&["rev-parse", "--verify", "HEAD"], Some(destination), cancel)
                .await?;
            if output.status.success() {
                let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
                return Ok((!commit.is_empty()).then_some(commit));
            }
        }

        debug!(
            remote_id = repository.remote_id,
            "Mirror has no resolvable head (empty repository)"
        );
        Ok(None)
    }
}

#[async_trait]
impl MirrorOperator for GitMirror {
    async fn sync(
        &self,
        repository: &repository::Model,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MirrorError> {
        let destination = PathBuf::from(&repository.local_path);

        let action = if destination.exists() {
            self.fetch_mirror(repository, &destination, cancel).await?;
            SyncAction::Fetched
        } else {
            self.clone_mirror(repository, &destination, cancel).await?;
            SyncAction::Cloned
        };

        let remote_ref = self.resolve_head(repository, &destination, cancel).await?;

        Ok(SyncOutcome { remote_ref, action })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_failures() {
        let err = classify_git_failure(
            "mirror clone failed",
            "fatal: Authentication failed for 'https://gitlab.example.com/x.git/'",
        );
        assert_eq!(err.kind, MirrorErrorKind::Auth);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_missing_repositories_as_gone() {
        let err = classify_git_failure(
            "mirror fetch failed",
            "remote: The project you were looking for could not be found.",
        );
        assert_eq!(err.kind, MirrorErrorKind::Gone);
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_wins_over_gone_when_both_phrases_appear() {
        let err = classify_git_failure(
            "mirror fetch failed",
            "remote: HTTP Basic: Access denied\nfatal: repository 'x' not found",
        );
        assert_eq!(err.kind, MirrorErrorKind::Auth);
    }

    #[test]
    fn classifies_network_failures_as_transient() {
        let err = classify_git_failure(
            "mirror clone failed",
            "fatal: unable to access 'https://x/': Could not resolve host: gitlab.example.com",
        );
        assert_eq!(err.kind, MirrorErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn unrecognized_failures_default_to_transient() {
        let err = classify_git_failure("mirror fetch failed", "error: something novel happened");
        assert_eq!(err.kind, MirrorErrorKind::Transient);
    }

    #[test]
    fn mirror_error_serializes_tagged_kind() {
        let err = MirrorError::gone("repository vanished");
        let json = serde_json::to_value(&err).expect("serialize error");
        assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("gone"));
        assert_eq!(
            json.get("message").and_then(|v| v.as_str()),
            Some("repository vanished")
        );
    }
}
