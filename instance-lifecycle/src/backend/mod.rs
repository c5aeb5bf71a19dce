//! Control-plane traits and implementations for instance-lifecycle

pub mod aws_cli;
pub mod cloudflare;
pub mod memory;

pub use aws_cli::AwsCliBackend;
pub use cloudflare::CloudflareDns;
pub use memory::InMemoryCloud;

use crate::error::Result;
use crate::types::{
    CommandInvocation, ImageInfo, InstanceDescriptor, VolumeDescriptor, VolumeRequest,
};

/// Compute and block-storage control plane
///
/// This trait abstracts over the provider, allowing for different
/// implementations (the provider CLI, an in-memory simulation for tests, etc.)
pub trait ComputeApi: Send + Sync {
    // === Instances ===

    /// Describe an instance; `None` if no instance matches
    fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDescriptor>>;

    /// Request the instance to start (returns before it is running)
    fn start_instance(&self, instance_id: &str) -> Result<()>;

    /// Request the instance to stop (returns before it is stopped)
    fn stop_instance(&self, instance_id: &str) -> Result<()>;

    // === Images ===

    /// Images whose name matches `name_filter`, oldest first
    fn describe_images(&self, name_filter: &str) -> Result<Vec<ImageInfo>>;

    // === Volumes ===

    /// Create a volume from a snapshot, returning its id
    fn create_volume(&self, request: &VolumeRequest) -> Result<String>;

    /// Describe volumes; ids that no longer exist are omitted
    fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>>;

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    fn detach_volume(&self, volume_id: &str) -> Result<()>;

    fn delete_volume(&self, volume_id: &str) -> Result<()>;
}

/// Out-of-band shell command execution on the instance
pub trait CommandChannel: Send + Sync {
    /// Dispatch a command, returning its id
    fn send_command(&self, instance_id: &str, command: &str) -> Result<String>;

    /// Fetch an invocation; `None` while the channel does not yet know about it
    fn get_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<Option<CommandInvocation>>;
}

/// Shared key-value store for small string values
pub trait ParameterStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`. With `overwrite` false the write only
    /// happens if the key is absent; returns whether the value was written.
    fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<bool>;

    /// Remove `key`; removing an absent key succeeds
    fn delete(&self, key: &str) -> Result<()>;
}

/// Publishes the instance address under its domain name
pub trait DnsUpdater: Send + Sync {
    /// Point the record at `ip`; idempotent
    fn update(&self, ip: &str) -> Result<()>;
}
