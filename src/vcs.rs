//! VCS abstraction and the GitHub implementation.
//!
//! The pipeline talks to `VcsClient`; the production implementation uses
//! the GitHub REST API for logs, PRs, comments, and merges, and libgit2
//! for checkout materialization and branch publishing. Tests inject their
//! own implementation.

use std::path::Path;

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    ApplyLocation, Cred, Diff, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use serde::{Deserialize, Serialize};

use crate::errors::StageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
}

#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Download the failing job's logs, preferring per-job logs and
    /// falling back to concatenating every job in the run.
    async fn fetch_job_logs(
        &self,
        repo: &str,
        run_id: &str,
        job_id: Option<&str>,
    ) -> Result<String, StageError>;

    /// Clone `repo` at `commit_sha` into `dest` (detached checkout).
    async fn materialize_checkout(
        &self,
        repo: &str,
        commit_sha: &str,
        dest: &Path,
    ) -> Result<(), StageError>;

    /// Commit the working-tree changes in `workspace`, push them as
    /// `branch`, and open a PR against `base_branch`.
    async fn open_fix_pr(
        &self,
        repo: &str,
        workspace: &Path,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequestInfo, StageError>;

    async fn comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<(), StageError>;

    async fn merge(&self, repo: &str, pr_number: u64) -> Result<(), StageError>;
}

/// Apply a unified diff to a checkout's working tree.
pub fn apply_diff(workspace: &Path, diff_text: &str) -> Result<(), StageError> {
    let repo = Repository::open(workspace)
        .map_err(|e| StageError::failed(format!("open checkout: {}", e)))?;
    let diff = Diff::from_buffer(diff_text.as_bytes())
        .map_err(|e| StageError::failed(format!("parse diff: {}", e)))?;
    repo.apply(&diff, ApplyLocation::WorkDir, None)
        .map_err(|e| StageError::failed(format!("apply diff: {}", e)))
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "remedy-agent")
    }

    fn clone_url(&self, repo: &str) -> String {
        if self.token.is_empty() {
            format!("https://github.com/{}.git", repo)
        } else {
            format!("https://x-access-token:{}@github.com/{}.git", self.token, repo)
        }
    }

    async fn fetch_single_job_logs(
        &self,
        repo: &str,
        job_id: &str,
    ) -> Result<String, StageError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/actions/jobs/{}/logs", repo, job_id),
            )
            .send()
            .await
            .map_err(|e| StageError::transient(format!("log fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StageError::Vcs {
                message: format!("log fetch returned {}", response.status()),
            });
        }
        response
            .text()
            .await
            .map_err(|e| StageError::transient(format!("log body unreadable: {}", e)))
    }
}

#[async_trait]
impl VcsClient for GitHubClient {
    async fn fetch_job_logs(
        &self,
        repo: &str,
        run_id: &str,
        job_id: Option<&str>,
    ) -> Result<String, StageError> {
        if let Some(job_id) = job_id
            && let Ok(logs) = self.fetch_single_job_logs(repo, job_id).await
        {
            return Ok(logs);
        }

        // Fall back to concatenating every job in the run.
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/actions/runs/{}/jobs", repo, run_id),
            )
            .send()
            .await
            .map_err(|e| StageError::transient(format!("job list fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StageError::Vcs {
                message: format!("job list returned {}", response.status()),
            });
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("job list unreadable: {}", e)))?;

        let mut combined = String::new();
        if let Some(jobs) = payload["jobs"].as_array() {
            for job in jobs {
                let Some(id) = job["id"].as_u64() else { continue };
                let name = job["name"].as_str().unwrap_or("job");
                if let Ok(logs) = self.fetch_single_job_logs(repo, &id.to_string()).await {
                    combined.push_str(&format!("===== {} =====\n{}\n", name, logs));
                }
            }
        }
        if combined.is_empty() {
            return Err(StageError::Vcs {
                message: "no job logs available".to_string(),
            });
        }
        Ok(combined)
    }

    async fn materialize_checkout(
        &self,
        repo: &str,
        commit_sha: &str,
        dest: &Path,
    ) -> Result<(), StageError> {
        let url = self.clone_url(repo);
        let sha = commit_sha.to_string();
        let dest = dest.to_path_buf();
        let token = self.token.clone();

        // libgit2 is blocking; keep it off the async workers.
        tokio::task::spawn_blocking(move || -> Result<(), StageError> {
            let mut callbacks = RemoteCallbacks::new();
            let token_for_creds = token.clone();
            callbacks.credentials(move |_url, _user, _allowed| {
                Cred::userpass_plaintext("x-access-token", &token_for_creds)
            });
            let mut fetch_opts = FetchOptions::new();
            if !token.is_empty() {
                fetch_opts.remote_callbacks(callbacks);
            }
            let repository = RepoBuilder::new()
                .fetch_options(fetch_opts)
                .clone(&url, &dest)
                .map_err(|e| StageError::transient(format!("clone failed: {}", e)))?;
            let oid = Oid::from_str(&sha)
                .map_err(|e| StageError::failed(format!("bad commit sha: {}", e)))?;
            let commit = repository
                .find_commit(oid)
                .map_err(|e| StageError::failed(format!("commit not found: {}", e)))?;
            repository
                .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
                .map_err(|e| StageError::failed(format!("checkout failed: {}", e)))?;
            repository
                .set_head_detached(oid)
                .map_err(|e| StageError::failed(format!("detach failed: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| StageError::failed(format!("checkout task panicked: {}", e)))?
    }

    async fn open_fix_pr(
        &self,
        repo: &str,
        workspace: &Path,
        branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequestInfo, StageError> {
        let workspace = workspace.to_path_buf();
        let branch_name = branch.to_string();
        let token = self.token.clone();
        let commit_message = title.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), StageError> {
            let repository = Repository::open(&workspace)
                .map_err(|e| StageError::failed(format!("open checkout: {}", e)))?;
            let mut index = repository
                .index()
                .map_err(|e| StageError::failed(format!("index: {}", e)))?;
            index
                .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .map_err(|e| StageError::failed(format!("stage changes: {}", e)))?;
            index
                .write()
                .map_err(|e| StageError::failed(format!("write index: {}", e)))?;
            let tree_id = index
                .write_tree()
                .map_err(|e| StageError::failed(format!("write tree: {}", e)))?;
            let tree = repository
                .find_tree(tree_id)
                .map_err(|e| StageError::failed(format!("find tree: {}", e)))?;
            let signature = Signature::now("remedy-agent", "agent@remedy.invalid")
                .map_err(|e| StageError::failed(format!("signature: {}", e)))?;
            let parent = repository
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| StageError::failed(format!("head commit: {}", e)))?;
            let commit_id = repository
                .commit(None, &signature, &signature, &commit_message, &tree, &[&parent])
                .map_err(|e| StageError::failed(format!("commit: {}", e)))?;
            let commit = repository
                .find_commit(commit_id)
                .map_err(|e| StageError::failed(format!("find commit: {}", e)))?;
            repository
                .branch(&branch_name, &commit, true)
                .map_err(|e| StageError::failed(format!("branch: {}", e)))?;

            let mut remote = repository
                .find_remote("origin")
                .map_err(|e| StageError::failed(format!("remote: {}", e)))?;
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(move |_url, _user, _allowed| {
                Cred::userpass_plaintext("x-access-token", &token)
            });
            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch_name);
            remote
                .push(&[&refspec], Some(&mut push_opts))
                .map_err(|e| StageError::transient(format!("push failed: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| StageError::failed(format!("push task panicked: {}", e)))??;

        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{}/pulls", repo))
            .json(&serde_json::json!({
                "title": title,
                "head": branch,
                "base": base_branch,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| StageError::transient(format!("PR create failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StageError::Vcs {
                message: format!("PR create returned {}", response.status()),
            });
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("PR response unreadable: {}", e)))?;
        let number = payload["number"].as_u64().ok_or_else(|| StageError::Vcs {
            message: "PR response missing number".to_string(),
        })?;
        let url = payload["html_url"].as_str().unwrap_or_default().to_string();

        if !labels.is_empty() {
            let _ = self
                .request(
                    reqwest::Method::POST,
                    &format!("/repos/{}/issues/{}/labels", repo, number),
                )
                .json(&serde_json::json!({"labels": labels}))
                .send()
                .await;
        }

        Ok(PullRequestInfo {
            number,
            url,
            head_branch: branch.to_string(),
        })
    }

    async fn comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<(), StageError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/issues/{}/comments", repo, pr_number),
            )
            .json(&serde_json::json!({"body": body}))
            .send()
            .await
            .map_err(|e| StageError::transient(format!("comment failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StageError::Vcs {
                message: format!("comment returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn merge(&self, repo: &str, pr_number: u64) -> Result<(), StageError> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{}/pulls/{}/merge", repo, pr_number),
            )
            .json(&serde_json::json!({"merge_method": "squash"}))
            .send()
            .await
            .map_err(|e| StageError::transient(format!("merge failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StageError::Vcs {
                message: format!("merge returned {}", response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("file.txt"), "original\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("test", "test@test.invalid").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[test]
    fn apply_diff_edits_working_tree() {
        let dir = tempfile::tempdir().unwrap();
        let _repo = init_repo(dir.path());
        let diff = "\
diff --git a/file.txt b/file.txt
--- a/file.txt
+++ b/file.txt
@@ -1 +1 @@
-original
+patched
";
        apply_diff(dir.path(), diff).unwrap();
        let content = std::fs::read_to_string(dir.path().join("file.txt")).unwrap();
        assert_eq!(content, "patched\n");
    }

    #[test]
    fn apply_diff_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let _repo = init_repo(dir.path());
        assert!(apply_diff(dir.path(), "not a diff").is_err());
    }

    #[test]
    fn clone_url_embeds_token_only_when_present() {
        let anon = GitHubClient::new("https://api.github.com", "");
        assert_eq!(anon.clone_url("org/app"), "https://github.com/org/app.git");
        let authed = GitHubClient::new("https://api.github.com", "tok");
        assert!(authed.clone_url("org/app").contains("x-access-token:tok@"));
    }
}
