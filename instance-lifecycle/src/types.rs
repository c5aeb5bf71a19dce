//! Core types for instance lifecycle management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw power state as reported by the compute control plane
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PowerState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl PowerState {
    /// Parse a provider state name. Unrecognised names are kept verbatim.
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "pending" => PowerState::Pending,
            "running" => PowerState::Running,
            "shutting-down" => PowerState::ShuttingDown,
            "terminated" => PowerState::Terminated,
            "stopping" => PowerState::Stopping,
            "stopped" => PowerState::Stopped,
            _ => PowerState::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PowerState::Pending => "pending",
            PowerState::Running => "running",
            PowerState::ShuttingDown => "shutting-down",
            PowerState::Terminated => "terminated",
            PowerState::Stopping => "stopping",
            PowerState::Stopped => "stopped",
            PowerState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical lifecycle state, derived from power state and attached volumes.
///
/// Never stored; recomputed on every probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Stopped,
    Hibernated,
    Pending,
    Stopping,
    Terminated,
    /// Running with no volume attached. Only reachable through outside interference.
    Inconsistent,
    Unknown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
            ServerState::Hibernated => "hibernated",
            ServerState::Pending => "pending",
            ServerState::Stopping => "stopping",
            ServerState::Terminated => "terminated",
            ServerState::Inconsistent => "inconsistent",
            ServerState::Unknown => "unknown",
        }
    }

    /// States from which the instance can be brought up
    pub fn is_startable(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Hibernated)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A volume as listed on the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub volume_id: String,
    pub device_name: String,
}

/// What the compute control plane reports about an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub id: String,
    pub power_state: PowerState,
    pub public_ip: Option<String>,
    pub volumes: Vec<VolumeRef>,
    pub availability_zone: String,
}

impl InstanceDescriptor {
    pub fn volume_ids(&self) -> Vec<String> {
        self.volumes.iter().map(|v| v.volume_id.clone()).collect()
    }
}

/// Volume state as reported by the storage control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    Other(String),
}

impl VolumeState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "in-use" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            _ => VolumeState::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
            VolumeState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attachment state of a volume to an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Other(String),
}

impl AttachmentState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "attaching" => AttachmentState::Attaching,
            "attached" => AttachmentState::Attached,
            "detaching" => AttachmentState::Detaching,
            "detached" => AttachmentState::Detached,
            _ => AttachmentState::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AttachmentState::Attaching => "attaching",
            AttachmentState::Attached => "attached",
            AttachmentState::Detaching => "detaching",
            AttachmentState::Detached => "detached",
            AttachmentState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Richer view of a volume fetched while waiting on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub id: String,
    pub state: VolumeState,
    /// `None` when the volume has no attachment at all
    pub attachment_state: Option<AttachmentState>,
}

/// Parameters for creating a volume from a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub availability_zone: String,
    pub snapshot_id: String,
    pub size_gib: u32,
    pub volume_type: String,
    pub encrypted: bool,
}

/// A machine image that may carry a storage snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub image_id: String,
    pub name: String,
    /// ISO-8601 creation timestamp as reported by the provider
    pub creation_date: String,
    pub available: bool,
    /// Backing storage snapshot of the root mapping, if any
    pub snapshot_id: Option<String>,
}

/// Value held under the lock key while a workflow runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLockRecord {
    pub action: String,
    pub acquired_at_epoch_millis: i64,
}

impl ActionLockRecord {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            acquired_at_epoch_millis: Utc::now().timestamp_millis(),
        }
    }

    /// How long the lock has been held, in whole seconds
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now.timestamp_millis() - self.acquired_at_epoch_millis).max(0) / 1000
    }
}

/// Terminal or non-terminal status of a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Success,
    Failed,
}

impl InvocationStatus {
    /// Map the remote channel's status names onto the three we care about
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Success" => InvocationStatus::Success,
            "Failed" | "Cancelled" | "TimedOut" | "Cancelling" | "Undeliverable"
            | "Terminated" => InvocationStatus::Failed,
            _ => InvocationStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command_id: String,
    pub status: InvocationStatus,
    pub stdout: String,
    pub stderr: String,
}

/// One backup known to exist on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: String,
    pub size: String,
    pub date: String,
}

/// Backup listing cached in the parameter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBackupList {
    pub backups: Vec<BackupEntry>,
    pub cached_at: DateTime<Utc>,
}

/// A backup name that is safe to embed in a shell command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupName(String);

impl BackupName {
    pub const LATEST: &'static str = "latest";

    /// Create a new backup name
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() {
            return Err("Backup name cannot be empty".to_string());
        }
        if name.len() > 128 {
            return Err("Backup name cannot be longer than 128 characters".to_string());
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!("Backup name cannot contain '{}'", c));
        }
        Ok(BackupName(name))
    }

    /// The name restore falls back to when none is given
    pub fn latest() -> Self {
        BackupName(Self::LATEST.to_string())
    }

    /// Get the backup name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackupName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupName::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_keeps_unknown_names() {
        assert_eq!(PowerState::parse("RUNNING"), PowerState::Running);
        assert_eq!(
            PowerState::parse("rebooting"),
            PowerState::Other("rebooting".to_string())
        );
        assert_eq!(PowerState::parse("shutting-down").as_str(), "shutting-down");
    }

    #[test]
    fn invocation_status_maps_terminal_failures() {
        assert_eq!(InvocationStatus::parse("Success"), InvocationStatus::Success);
        assert_eq!(InvocationStatus::parse("TimedOut"), InvocationStatus::Failed);
        assert_eq!(InvocationStatus::parse("InProgress"), InvocationStatus::Pending);
        assert_eq!(InvocationStatus::parse("Delayed"), InvocationStatus::Pending);
    }

    #[test]
    fn backup_name_rejects_shell_metacharacters() {
        assert!(BackupName::new("nightly-2024").is_ok());
        assert!(BackupName::new("world_v1.2").is_ok());
        assert!(BackupName::new("").is_err());
        assert!(BackupName::new("a; rm -rf /").is_err());
        assert!(BackupName::new("$(reboot)").is_err());
        assert!(BackupName::new("x".repeat(129)).is_err());
    }

    #[test]
    fn lock_record_serializes_camel_case() {
        let record = ActionLockRecord {
            action: "start".to_string(),
            acquired_at_epoch_millis: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"action":"start","acquiredAtEpochMillis":1700000000000}"#
        );
    }

    #[test]
    fn lock_age_never_negative() {
        let record = ActionLockRecord {
            action: "stop".to_string(),
            acquired_at_epoch_millis: Utc::now().timestamp_millis() + 60_000,
        };
        assert_eq!(record.age_secs(Utc::now()), 0);
    }
}
