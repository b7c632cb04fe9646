// Message types for the HTTP trigger

use serde::{Deserialize, Serialize};

// Query string of GET /run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunQuery {
    pub emotion: Option<String>,
}

// Outcome of a gesture run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

// Response body for a gesture that was attempted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResponse {
    pub status: RunStatus,
    pub executed: String,
}

impl RunResponse {
    pub fn success(executed: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Success,
            executed: executed.into(),
        }
    }

    pub fn failed(executed: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            executed: executed.into(),
        }
    }
}

// Response body for a rejected request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health status reported by GET /health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: HealthStatus,
}
