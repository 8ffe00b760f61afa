//! GitLab discovery implementation
//!
//! Lists a group's projects through the GitLab REST API v4, paginating until
//! the group is exhausted. Rate-limit responses are waited out, transient
//! failures are retried with exponential backoff, and credential rejections
//! abort the run immediately.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::GitLabConfig;
use crate::discovery::{DiscoveryError, DiscoverySource, RepositoryDescriptor};

/// Fallback wait when a 429 response carries no usable Retry-After header.
const DEFAULT_RATE_LIMIT_WAIT_SECONDS: u64 = 60;

/// Per-request timeout for listing calls.
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Discovery client for one GitLab group.
#[derive(Debug, Clone)]
pub struct GitLabDiscovery {
    config: GitLabConfig,
    client: reqwest::Client,
}

/// Project entry as returned by `GET /groups/:id/projects`.
#[derive(Debug, Deserialize)]
struct GitLabProject {
    id: i64,
    path_with_namespace: String,
    default_branch: Option<String>,
    http_url_to_repo: String,
    ssh_url_to_repo: String,
}

impl GitLabProject {
    fn into_descriptor(self, clone_over_ssh: bool) -> RepositoryDescriptor {
        let clone_url = if clone_over_ssh {
            self.ssh_url_to_repo
        } else {
            self.http_url_to_repo
        };
        RepositoryDescriptor {
            remote_id: self.id,
            name: self.path_with_namespace,
            clone_url,
            default_branch: self.default_branch,
        }
    }
}

/// One page request outcome before retry/backoff policy is applied.
enum PageResponse {
    Projects(Vec<GitLabProject>),
    RateLimited { retry_after_secs: u64 },
}

impl GitLabDiscovery {
    /// Create a new discovery client for the configured group.
    pub fn new(config: GitLabConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Listing URL for one page of the group's projects.
    fn projects_url(&self, page: u32) -> Result<Url, url::ParseError> {
        // Group paths contain slashes and must arrive as one path segment.
        let group = self.config.group.replace('/', "%2F");
        let mut url = Url::parse(&format!(
            "{}/api/v4/groups/{}/projects",
            self.config.base_url.trim_end_matches('/'),
            group
        ))?;
        url.query_pairs_mut()
            .append_pair("per_page", &self.config.per_page.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("order_by", "id")
            .append_pair("sort", "asc");
        Ok(url)
    }

    /// Issue one page request and map the response by status class.
    ///
    /// Returns `Err(Some(DiscoveryError::Auth))` style results through the
    /// outer retry loop: auth failures come back as terminal errors, every
    /// other failure as a transient message for the bounded retry budget.
    async fn request_page(&self, page: u32) -> Result<PageResponse, PageFailure> {
        let url = self
            .projects_url(page)
            .map_err(|err| PageFailure::Transient(format!("invalid listing url: {}", err)))?;

        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = &self.config.token {
            request = request.header("PRIVATE-TOKEN", token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| PageFailure::Transient(format!("network error: {}", err)))?;

        let status = response.status();
        if status.is_success() {
            let projects: Vec<GitLabProject> = response.json().await.map_err(|err| {
                PageFailure::Transient(format!("malformed project listing: {}", err))
            })?;
            return Ok(PageResponse::Projects(projects));
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECONDS);
            return Ok(PageResponse::RateLimited { retry_after_secs });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            error!(
                status = status.as_u16(),
                group = %self.config.group,
                "GitLab rejected discovery credentials"
            );
            return Err(PageFailure::Auth(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(PageFailure::Transient(format!(
            "listing returned status {}: {}",
            status, body
        )))
    }

    /// Fetch one page, waiting out rate limits and retrying transient
    /// failures up to the configured budget.
    async fn fetch_page(&self, page: u32) -> Result<Vec<GitLabProject>, DiscoveryError> {
        let mut attempts = 0u32;

        loop {
            match self.request_page(page).await {
                Ok(PageResponse::Projects(projects)) => return Ok(projects),
                Ok(PageResponse::RateLimited { retry_after_secs }) => {
                    // A rate-limited page is resumed, never dropped; the wait
                    // does not consume a retry attempt.
                    let wait = retry_after_secs.min(self.config.rate_limit_max_wait_seconds);
                    warn!(
                        page,
                        wait_seconds = wait,
                        "GitLab rate limited discovery; waiting before resuming"
                    );
                    sleep(Duration::from_secs(wait)).await;
                }
                Err(PageFailure::Auth(status)) => {
                    return Err(DiscoveryError::Auth { status });
                }
                Err(PageFailure::Transient(message)) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        return Err(DiscoveryError::Unavailable { attempts, message });
                    }
                    let delay = self.config.retry_base_ms * 2u64.pow(attempts - 1);
                    warn!(
                        page,
                        attempt = attempts,
                        delay_ms = delay,
                        error = %message,
                        "Transient discovery failure; retrying"
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}

enum PageFailure {
    Auth(u16),
    Transient(String),
}

#[async_trait]
impl DiscoverySource for GitLabDiscovery {
    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>, DiscoveryError> {
        let mut descriptors = Vec::new();
        let mut page = 1u32;

        loop {
            let projects = self.fetch_page(page).await?;
            let count = projects.len();
            debug!(page, count, "Fetched project listing page");

            descriptors.extend(
                projects
                    .into_iter()
                    .map(|project| project.into_descriptor(self.config.clone_over_ssh)),
            );

            // A short or empty page means the group is exhausted.
            if count < self.config.per_page as usize {
                break;
            }
            page += 1;
        }

        debug!(
            group = %self.config.group,
            total = descriptors.len(),
            "Discovery run completed"
        );
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(group: &str) -> GitLabConfig {
        GitLabConfig {
            base_url: "https://gitlab.example.com".to_string(),
            group: group.to_string(),
            ..GitLabConfig::default()
        }
    }

    #[test]
    fn projects_url_encodes_subgroup_paths() {
        let discovery = GitLabDiscovery::new(config_for("platform/infra"));
        let url = discovery.projects_url(3).expect("build url");
        assert!(url.path().contains("platform%2Finfra"));
        assert!(url.query().unwrap().contains("page=3"));
        assert!(url.query().unwrap().contains("per_page=100"));
    }

    #[test]
    fn descriptor_picks_clone_url_per_config() {
        let project = || GitLabProject {
            id: 7,
            path_with_namespace: "platform/api".to_string(),
            default_branch: Some("main".to_string()),
            http_url_to_repo: "https://gitlab.example.com/platform/api.git".to_string(),
            ssh_url_to_repo: "git@gitlab.example.com:platform/api.git".to_string(),
        };

        let over_http = project().into_descriptor(false);
        assert_eq!(
            over_http.clone_url,
            "https://gitlab.example.com/platform/api.git"
        );

        let over_ssh = project().into_descriptor(true);
        assert_eq!(over_ssh.clone_url, "git@gitlab.example.com:platform/api.git");
    }
}
