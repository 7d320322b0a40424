use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the comma-separated snapshot ids a replication client
/// already holds locally. The sender picks the newest one it also has as
/// the delta base.
pub const SNAPSHOT_PARENTS_HEADER: &str = "x-snapshot-parents";

/// Content type Docker uses when talking to volume plugins.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

// ---------------------------------------------------------------------------
// Workspace start submission
// ---------------------------------------------------------------------------

/// A request to (re)create the sandbox of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub user_id: String,
    pub dojo_ref: String,
    pub module_ref: String,
    pub challenge_ref: String,
    /// Practice mode grants administrative privileges inside the sandbox
    /// and replaces the real flag with a placeholder.
    #[serde(default)]
    pub practice: bool,
    /// Attach the sandbox to the internet-enabled network instead of the
    /// isolated one.
    #[serde(default)]
    pub internet: bool,
    /// Image override. Falls back to the daemon's configured image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub start_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Starting,
    Ready,
    Failed,
    /// Never seen, or the record expired.
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Starting => "starting",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Progress record polled by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStatus {
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl StartStatus {
    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Unknown,
            attempt: 0,
            max_attempts: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Docker volume plugin protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginActivateResponse {
    pub implements: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeCreateRequest {
    pub name: String,
    /// Docker sends `null` when no `--opt` was given.
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
}

/// Body shared by Remove, Get, Path, Mount and Unmount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeNameRequest {
    pub name: String,
    /// Mount/Unmount caller id.
    #[serde(default, rename = "ID")]
    pub id: Option<String>,
}

/// Response for calls that carry nothing but the error envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResponse {
    pub err: String,
}

impl ErrResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { err: message.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountpointResponse {
    pub mountpoint: String,
    pub err: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginVolumeInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<PluginVolumeInfo>,
    pub err: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResponse {
    pub volumes: Vec<PluginVolumeInfo>,
    pub err: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub capabilities: Capabilities,
    pub err: String,
}
