//! Remote repository discovery
//!
//! Defines the interface the scheduler uses to learn which repositories the
//! remote group currently contains, plus the GitLab implementation.

pub mod gitlab;

pub use gitlab::GitLabDiscovery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One repository as reported by the remote, reduced to what the mirror
/// engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Stable identifier assigned by the remote
    pub remote_id: i64,
    /// Path with namespace, used for display
    pub name: String,
    /// URL to clone and fetch from, resolved per configuration
    pub clone_url: String,
    /// Default branch advertised by the remote
    pub default_branch: Option<String>,
}

/// Errors a discovery run can end with.
///
/// Rate limiting is not represented here: the client waits out the
/// server-specified delay and resumes, so it never escapes a run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Credentials were rejected; fatal for this run, never retried.
    #[error("discovery authentication rejected (status {status})")]
    Auth { status: u16 },
    /// Transient failures exhausted the bounded retry budget.
    #[error("discovery unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },
}

/// Source of the remote group's current repository list.
///
/// One call lists the complete group; implementations page internally and
/// a failed run must leave no partial side effects behind.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>, DiscoveryError>;
}
