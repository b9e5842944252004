//! Outbound GitHub issue sync for unified tasks.
//!
//! System-domain tasks without an issue number sit in `github_sync_status =
//! pending` until this adapter mirrors them; a sync failure flips the row to
//! `error` rather than blocking anything else.

use mx_core::types::{GithubSyncStatus, UnifiedTask, UnifiedTaskStatus};
use mx_store::Store;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::IntegrationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: i64,
    pub html_url: String,
    pub open: bool,
}

pub struct GitHubClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self, IntegrationError> {
        let token = config.token.ok_or(IntegrationError::MissingToken)?;
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self {
            octocrab,
            owner: config.owner,
            repo: config.repo,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub async fn create_issue(
        &self,
        title: &str,
        body: Option<&str>,
    ) -> Result<IssueRef, IntegrationError> {
        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .create(title)
            .body(body.unwrap_or_default())
            .send()
            .await?;
        Ok(IssueRef {
            number: issue.number as i64,
            html_url: issue.html_url.to_string(),
            open: matches!(issue.state, octocrab::models::IssueState::Open),
        })
    }

    pub async fn fetch_issue(&self, number: u64) -> Result<IssueRef, IntegrationError> {
        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .get(number)
            .await?;
        Ok(IssueRef {
            number: issue.number as i64,
            html_url: issue.html_url.to_string(),
            open: matches!(issue.state, octocrab::models::IssueState::Open),
        })
    }
}

// ---------------------------------------------------------------------------
// TaskSyncer
// ---------------------------------------------------------------------------

/// Drives the store's pending-sync queue against GitHub.
pub struct TaskSyncer {
    client: GitHubClient,
    store: Store,
}

impl TaskSyncer {
    pub fn new(client: GitHubClient, store: Store) -> Self {
        Self { client, store }
    }

    /// Mirror every system-domain task awaiting sync. Returns how many rows
    /// reached `synced`; failures mark the row `error` and continue.
    pub async fn sync_pending(&self) -> Result<usize, IntegrationError> {
        let pending = self.store.unified_tasks_pending_sync().await?;
        let mut synced = 0;
        for task in pending {
            match self.sync_task(&task).await {
                Ok(issue) => {
                    info!(task_id = task.id, issue = issue.number, "task mirrored to github");
                    synced += 1;
                }
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "github sync failed");
                    self.store
                        .set_github_linkage(task.id, None, None, None, GithubSyncStatus::Error)
                        .await?;
                }
            }
        }
        Ok(synced)
    }

    async fn sync_task(&self, task: &UnifiedTask) -> Result<IssueRef, IntegrationError> {
        let issue = self
            .client
            .create_issue(&task.title, task.description.as_deref())
            .await?;
        self.store
            .set_github_linkage(
                task.id,
                Some(issue.number),
                Some(issue.html_url.clone()),
                Some(self.client.repo_slug()),
                GithubSyncStatus::Synced,
            )
            .await?;
        Ok(issue)
    }

    /// Pull issue state back: a closed issue marks the task done.
    pub async fn pull_status(&self, task: &UnifiedTask) -> Result<bool, IntegrationError> {
        let Some(number) = task.github_issue_number else {
            return Ok(false);
        };
        let issue = self.client.fetch_issue(number as u64).await?;
        if !issue.open && task.status != UnifiedTaskStatus::Done {
            self.store
                .set_unified_status(task.id, UnifiedTaskStatus::Done)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requires_token() {
        let result = GitHubClient::new(GitHubConfig {
            token: None,
            owner: "acme".into(),
            repo: "widgets".into(),
        });
        assert!(matches!(result, Err(IntegrationError::MissingToken)));
    }

    #[tokio::test]
    async fn client_carries_repo_identity() {
        let client = GitHubClient::new(GitHubConfig {
            token: Some("ghp_test".into()),
            owner: "acme".into(),
            repo: "widgets".into(),
        })
        .unwrap();
        assert_eq!(client.owner(), "acme");
        assert_eq!(client.repo(), "widgets");
        assert_eq!(client.repo_slug(), "acme/widgets");
    }

    #[test]
    fn issue_ref_serde_roundtrip() {
        let issue = IssueRef {
            number: 42,
            html_url: "https://github.com/acme/widgets/issues/42".into(),
            open: true,
        };
        let json = serde_json::to_string(&issue).unwrap();
        let parsed: IssueRef = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.number, 42);
        assert!(parsed.open);
    }
}
