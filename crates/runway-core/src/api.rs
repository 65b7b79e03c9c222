//! Client for the status-reporting collaborator.
//!
//! The engine POSTs a JSON document on every pending/running/finished
//! transition and re-fetches records during reconciliation. A failed POST
//! never aborts a run: the engine degrades to local filesystem signals
//! and warns.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::RunContext;
use crate::error::{RunwayError, RunwayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Output,
    Batch,
    Commit,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Batch => "batch",
            Self::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputNotification {
    pub job_type: String,
    pub commit_sha: String,
    pub batch_label: String,
    pub platform: String,
    /// Mixed strings/objects, serialized as a JSON array.
    pub configurations: Value,
    pub extra_parameters: Value,
    pub is_pending: bool,
    pub is_running: bool,
    pub is_failed: bool,
    pub metrics: Value,
    pub output_directory: String,
}

impl OutputNotification {
    pub fn for_context(context: &RunContext, job_type: &str, commit_sha: &str) -> Self {
        use crate::types::TaskStatus;
        let status = context.status();
        Self {
            job_type: job_type.to_string(),
            commit_sha: commit_sha.to_string(),
            batch_label: context.batch_label.clone(),
            platform: context.platform.clone(),
            configurations: serde_json::to_value(&context.configurations)
                .unwrap_or(Value::Array(Vec::new())),
            extra_parameters: Value::Object(context.extra_parameters.clone()),
            is_pending: status == TaskStatus::Pending,
            is_running: status == TaskStatus::Running,
            is_failed: status == TaskStatus::Failed,
            metrics: Value::Object(serde_json::Map::new()),
            output_directory: context.output_dir.to_string_lossy().to_string(),
        }
    }
}

/// Externally reported terminal record of one task.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputRecord {
    pub id: String,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub is_failed: bool,
}

pub struct NotifyClient {
    client: reqwest::Client,
    base_url: String,
}

impl NotifyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// POST `{base}/{object_type}/`. Returns the record id when the
    /// collaborator assigns one; on any failure, warns and returns None.
    pub async fn notify(
        &self,
        object_type: ObjectType,
        payload: &OutputNotification,
    ) -> Option<String> {
        let url = format!("{}/{}/", self.base_url, object_type.as_str());
        let response = match self.client.post(&url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, "status notification failed, continuing on local signals: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                url,
                status = %response.status(),
                "status notification rejected, continuing on local signals"
            );
            return None;
        }
        match response.json::<Value>().await {
            Ok(body) => body.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            Err(_) => None,
        }
    }

    /// GET `{base}/{object_type}/{id}/` for reconciliation.
    pub async fn fetch(&self, object_type: ObjectType, id: &str) -> RunwayResult<OutputRecord> {
        let url = format!("{}/{}/{}/", self.base_url, object_type.as_str(), id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RunwayError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RunwayError::Api(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<OutputRecord>()
            .await
            .map_err(|e| RunwayError::Api(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContextBuilder;
    use crate::types::TaskStatus;

    #[test]
    fn test_notification_payload_shape() {
        let mut ctx = RunContextBuilder::new("nightly", "linux")
            .database("/db")
            .input("/db/a.raw")
            .output_root("/out")
            .build()
            .unwrap();
        ctx.set_status(TaskStatus::Pending);
        let payload = OutputNotification::for_context(&ctx, "local", "deadbeef");
        assert!(payload.is_pending);
        assert!(!payload.is_running);
        assert!(!payload.is_failed);
        assert_eq!(payload.batch_label, "nightly");
        assert!(payload.configurations.is_array());
        assert!(payload.extra_parameters.is_object());

        let json = serde_json::to_value(&payload).unwrap();
        for field in [
            "job_type",
            "commit_sha",
            "batch_label",
            "platform",
            "configurations",
            "extra_parameters",
            "is_pending",
            "is_running",
            "is_failed",
            "metrics",
            "output_directory",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
