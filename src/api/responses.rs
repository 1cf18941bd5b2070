//! API request and response types.
//!
//! Run summaries, run detail and timeline data are serialized straight from
//! the scheduler's views; this module holds the bodies that exist only at
//! the HTTP boundary.

use serde::{Deserialize, Serialize};

use crate::core::types::RunId;
use crate::execution::WorkerSummary;
use crate::scheduler::SchedulerState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub scheduler: String,
}

impl HealthResponse {
    pub fn new(state: SchedulerState) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            scheduler: format!("{:?}", state).to_lowercase(),
        }
    }
}

/// Body of `POST /v1/dagruns`.
///
/// `world` is either a world document as JSON or a YAML string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default = "default_tag")]
    pub tag: String,
    pub world: serde_json::Value,
}

fn default_tag() -> String {
    "default".to_string()
}

/// Response to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "runID")]
    pub run_id: RunId,
}

/// Query of `GET /v1/dagruns`.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// `1` or `true` includes terminal runs.
    #[serde(default)]
    pub all: Option<String>,
}

impl ListRunsQuery {
    pub fn include_terminal(&self) -> bool {
        matches!(self.all.as_deref(), Some("1") | Some("true"))
    }
}

/// Simple acknowledgement.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Registered workers.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerSummary>,
    pub count: usize,
}
