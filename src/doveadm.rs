//! Client for the primary's doveadm-compatible HTTP admin API.
//!
//! Commands travel as single-element arrays of `[name, params, tag]` and the
//! API reports command failures inside HTTP 200 bodies, so both layers are
//! checked. The only two commands the controller issues are `sync` (dsync a
//! user towards the configured destination, optionally resuming from a
//! cursor) and `user` (enumerate mailboxes for the reconciler).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const API_PATH: &str = "/doveadm/v1";
const API_USERNAME: &str = "doveadm";
const SYNC_TAG: &str = "maildrift-sync";
const LIST_USERS_TAG: &str = "maildrift-list-users";

#[derive(Debug, thiserror::Error)]
pub enum DoveadmError {
    #[error("admin api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("admin api returned status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("admin api command failed (tag {tag}): {kind} (exit code {exit_code})")]
    Command {
        tag: String,
        kind: String,
        exit_code: i64,
    },
    #[error("unexpected admin api response: {0}")]
    Decode(String),
}

/// Result of a `sync` command. `state` is the opaque cursor to pass on the
/// next call; the API may omit it.
#[derive(Debug)]
pub struct SyncOutcome {
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailUser {
    pub username: String,
}

/// Capability to enumerate the cluster's mailbox owners. Split out so the
/// reconciler can run against a scripted directory in tests.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<MailUser>, DoveadmError>;
}

// Each response entry is `[status, payload, tag]`; payload shape depends on
// the command and on whether the entry reports an error.
type ResponseEntry = (String, serde_json::Value, String);

#[derive(Debug, Deserialize)]
struct CommandFailure {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "exitCode", default)]
    exit_code: i64,
}

pub struct DoveadmClient {
    base_url: String,
    password: String,
    http: reqwest::Client,
}

impl DoveadmClient {
    pub fn new(base_url: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            password: password.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn execute(
        &self,
        command: serde_json::Value,
    ) -> Result<Vec<ResponseEntry>, DoveadmError> {
        let url = format!("{}{}", self.base_url, API_PATH);
        let response = self
            .http
            .post(url)
            .basic_auth(API_USERNAME, Some(&self.password))
            .json(&serde_json::Value::Array(vec![command]))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DoveadmError::Status { status, body });
        }

        let entries: Vec<ResponseEntry> = serde_json::from_str(&body)
            .map_err(|err| DoveadmError::Decode(format!("{err} in {body:?}")))?;

        for (kind, payload, tag) in &entries {
            if kind == "error" {
                let failure: CommandFailure = serde_json::from_value(payload.clone())
                    .unwrap_or_else(|_| CommandFailure {
                        kind: "unknown".to_string(),
                        exit_code: 0,
                    });
                return Err(DoveadmError::Command {
                    tag: tag.clone(),
                    kind: failure.kind,
                    exit_code: failure.exit_code,
                });
            }
        }
        Ok(entries)
    }

    /// Replicates `username` to `destination`. A non-empty `state` cursor
    /// makes the sync incremental; the returned cursor (if any) resumes the
    /// next one.
    pub async fn sync(
        &self,
        username: &str,
        destination: &str,
        state: Option<&str>,
    ) -> Result<SyncOutcome, DoveadmError> {
        let mut params = json!({
            "destination": [destination],
            "user": username,
        });
        if let Some(state) = state.filter(|s| !s.is_empty()) {
            params["state"] = json!(state);
        }

        let entries = self.execute(json!(["sync", params, SYNC_TAG])).await?;
        let state = entries.iter().find_map(|(_, payload, _)| {
            payload
                .get("state")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        Ok(SyncOutcome { state })
    }

    pub async fn list_users(&self) -> Result<Vec<MailUser>, DoveadmError> {
        let entries = self
            .execute(json!(["user", { "userMask": "*" }, LIST_USERS_TAG]))
            .await?;
        for (_, payload, _) in entries {
            if payload.is_array() {
                return serde_json::from_value(payload)
                    .map_err(|err| DoveadmError::Decode(err.to_string()));
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl UserDirectory for DoveadmClient {
    async fn list_users(&self) -> Result<Vec<MailUser>, DoveadmError> {
        DoveadmClient::list_users(self).await
    }
}
