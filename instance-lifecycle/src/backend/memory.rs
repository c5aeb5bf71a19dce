//! In-memory simulation of the control planes
//!
//! Transitions advance one step each time they are observed: an instance
//! asked to start reads `pending` once and `running` after that, a new volume
//! reads `creating` once, an attachment reads `attaching` once, and so on.
//! This keeps every wait in the orchestrator exercised without sleeping.

use crate::backend::{CommandChannel, ComputeApi, DnsUpdater, ParameterStore};
use crate::error::{Error, Result};
use crate::types::{
    AttachmentState, CommandInvocation, ImageInfo, InstanceDescriptor, InvocationStatus,
    PowerState, VolumeDescriptor, VolumeRef, VolumeRequest, VolumeState,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// `/dev/xvda` .. `/dev/xvdz`, then `/dev/xvdaa`, `/dev/xvdab`, ...
fn device_name(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
    }
    letters.iter().rev().fold(String::from("/dev/xvd"), |mut name, c| {
        name.push(*c);
        name
    })
}

/// Control-plane calls, for counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeInstance,
    StartInstance,
    StopInstance,
    DescribeImages,
    CreateVolume,
    DescribeVolumes,
    AttachVolume,
    DetachVolume,
    DeleteVolume,
    SendCommand,
    GetInvocation,
    GetParameter,
    PutParameter,
    DeleteParameter,
    UpdateDns,
}

/// How a dispatched command behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCommand {
    /// Polls answered with "invocation not yet visible"
    pub not_found_polls: u32,
    /// Polls answered with a pending status after becoming visible
    pub pending_polls: u32,
    pub status: InvocationStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedCommand {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            not_found_polls: 0,
            pending_polls: 0,
            status: InvocationStatus::Success,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Failed,
            stderr: stderr.into(),
            ..Self::success("")
        }
    }

    /// Never becomes visible to the channel
    pub fn lost() -> Self {
        Self {
            not_found_polls: u32::MAX,
            ..Self::success("")
        }
    }

    pub fn after_not_found(mut self, polls: u32) -> Self {
        self.not_found_polls = polls;
        self
    }

    pub fn after_pending(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }
}

#[derive(Debug)]
struct SimInstance {
    power: PowerState,
    availability_zone: String,
    public_ip: Option<String>,
    ip_on_start: String,
    volumes: Vec<VolumeRef>,
}

#[derive(Debug)]
struct SimAttachment {
    instance_id: String,
    device: String,
    state: AttachmentState,
}

#[derive(Debug)]
struct SimVolume {
    state: VolumeState,
    snapshot_id: Option<String>,
    attachment: Option<SimAttachment>,
}

#[derive(Debug)]
struct SimInvocation {
    instance_id: String,
    script: ScriptedCommand,
}

#[derive(Debug, Default)]
struct CloudState {
    instances: HashMap<String, SimInstance>,
    volumes: HashMap<String, SimVolume>,
    images: Vec<ImageInfo>,
    parameters: HashMap<String, String>,
    scripts: Vec<(String, ScriptedCommand)>,
    invocations: HashMap<String, SimInvocation>,
    dispatched: Vec<String>,
    dns_records: Vec<String>,
    calls: HashMap<Operation, u32>,
    failures: HashMap<Operation, String>,
    fail_new_volumes: bool,
    next_id: u64,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }

    /// Count the call and fail it if a failure was injected
    fn enter(&mut self, op: Operation) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.remove(&op) {
            Some(message) => Err(Error::Upstream(message)),
            None => Ok(()),
        }
    }

    fn instance_mut(&mut self, instance_id: &str) -> Result<&mut SimInstance> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound(format!("Instance {}", instance_id)))
    }
}

/// Simulated compute, storage, command, parameter and DNS planes
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // === Setup ===

    /// Add an instance with existing volumes attached at `/dev/xvda`, `/dev/xvdb`, ...
    pub fn add_instance(&self, instance_id: &str, power: PowerState, volume_ids: &[&str]) {
        let mut state = self.state();
        let mut volumes = Vec::new();
        for (index, volume_id) in volume_ids.iter().enumerate() {
            let device = device_name(index);
            state.volumes.insert(
                volume_id.to_string(),
                SimVolume {
                    state: VolumeState::InUse,
                    snapshot_id: None,
                    attachment: Some(SimAttachment {
                        instance_id: instance_id.to_string(),
                        device: device.clone(),
                        state: AttachmentState::Attached,
                    }),
                },
            );
            volumes.push(VolumeRef {
                volume_id: volume_id.to_string(),
                device_name: device,
            });
        }

        let ip_on_start = "198.51.100.10".to_string();
        let public_ip = (power == PowerState::Running).then(|| ip_on_start.clone());
        state.instances.insert(
            instance_id.to_string(),
            SimInstance {
                power,
                availability_zone: "us-east-1a".to_string(),
                public_ip,
                ip_on_start,
                volumes,
            },
        );
    }

    /// Address the instance receives on its next start (and now, if running)
    pub fn set_public_ip(&self, instance_id: &str, ip: &str) {
        let mut state = self.state();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.ip_on_start = ip.to_string();
            if instance.public_ip.is_some() {
                instance.public_ip = Some(ip.to_string());
            }
        }
    }

    /// Force a power state, e.g. to simulate outside interference
    pub fn set_power_state(&self, instance_id: &str, power: PowerState) {
        if let Some(instance) = self.state().instances.get_mut(instance_id) {
            instance.power = power;
        }
    }

    pub fn add_image(&self, image: ImageInfo) {
        self.state().images.push(image);
    }

    /// Commands containing `pattern` behave as `script`; first match wins
    pub fn script_command(&self, pattern: &str, script: ScriptedCommand) {
        self.state().scripts.push((pattern.to_string(), script));
    }

    /// Make the next call of `op` fail with an upstream error
    pub fn fail_next(&self, op: Operation, message: &str) {
        self.state().failures.insert(op, message.to_string());
    }

    /// Volumes created from now on land in the `error` state
    pub fn fail_volume_creation(&self) {
        self.state().fail_new_volumes = true;
    }

    // === Inspection ===

    pub fn calls(&self, op: Operation) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every command dispatched so far, in order
    pub fn dispatched_commands(&self) -> Vec<String> {
        self.state().dispatched.clone()
    }

    /// Every address pushed to DNS, in order
    pub fn dns_updates(&self) -> Vec<String> {
        self.state().dns_records.clone()
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.state().parameters.get(key).cloned()
    }

    pub fn volume_exists(&self, volume_id: &str) -> bool {
        self.state().volumes.contains_key(volume_id)
    }

    /// Snapshot a volume was created from, if it was created here
    pub fn volume_snapshot(&self, volume_id: &str) -> Option<String> {
        self.state()
            .volumes
            .get(volume_id)
            .and_then(|v| v.snapshot_id.clone())
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }
}

impl ComputeApi for InMemoryCloud {
    fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDescriptor>> {
        let mut state = self.state();
        state.enter(Operation::DescribeInstance)?;
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Ok(None);
        };

        let descriptor = InstanceDescriptor {
            id: instance_id.to_string(),
            power_state: instance.power.clone(),
            public_ip: instance.public_ip.clone(),
            volumes: instance.volumes.clone(),
            availability_zone: instance.availability_zone.clone(),
        };

        match instance.power {
            PowerState::Pending => {
                instance.power = PowerState::Running;
                instance.public_ip = Some(instance.ip_on_start.clone());
            }
            PowerState::Stopping => {
                instance.power = PowerState::Stopped;
                instance.public_ip = None;
            }
            _ => {}
        }

        Ok(Some(descriptor))
    }

    fn start_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::StartInstance)?;
        let instance = state.instance_mut(instance_id)?;
        match instance.power {
            PowerState::Stopped if instance.volumes.is_empty() => Err(Error::Upstream(format!(
                "InvalidParameterCombination: instance {} has no root volume",
                instance_id
            ))),
            PowerState::Stopped => {
                instance.power = PowerState::Pending;
                Ok(())
            }
            PowerState::Pending | PowerState::Running => Ok(()),
            ref other => Err(Error::Upstream(format!(
                "IncorrectInstanceState: instance {} is {}",
                instance_id, other
            ))),
        }
    }

    fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::StopInstance)?;
        let instance = state.instance_mut(instance_id)?;
        match instance.power {
            PowerState::Running | PowerState::Pending => {
                instance.power = PowerState::Stopping;
                Ok(())
            }
            PowerState::Stopping | PowerState::Stopped => Ok(()),
            ref other => Err(Error::Upstream(format!(
                "IncorrectInstanceState: instance {} is {}",
                instance_id, other
            ))),
        }
    }

    fn describe_images(&self, name_filter: &str) -> Result<Vec<ImageInfo>> {
        let mut state = self.state();
        state.enter(Operation::DescribeImages)?;
        let prefix = name_filter.trim_end_matches('*');
        let mut images: Vec<ImageInfo> = state
            .images
            .iter()
            .filter(|image| image.name.starts_with(prefix))
            .cloned()
            .collect();
        images.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
        Ok(images)
    }

    fn create_volume(&self, request: &VolumeRequest) -> Result<String> {
        let mut state = self.state();
        state.enter(Operation::CreateVolume)?;
        let volume_id = state.next_id("vol");
        let initial = if state.fail_new_volumes {
            VolumeState::Error
        } else {
            VolumeState::Creating
        };
        state.volumes.insert(
            volume_id.clone(),
            SimVolume {
                state: initial,
                snapshot_id: Some(request.snapshot_id.clone()),
                attachment: None,
            },
        );
        Ok(volume_id)
    }

    fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>> {
        let mut state = self.state();
        state.enter(Operation::DescribeVolumes)?;
        let mut described = Vec::new();
        let mut detached = Vec::new();

        for id in volume_ids {
            let Some(volume) = state.volumes.get_mut(id) else {
                continue;
            };
            described.push(VolumeDescriptor {
                id: id.clone(),
                state: volume.state.clone(),
                attachment_state: volume.attachment.as_ref().map(|a| a.state.clone()),
            });

            if volume.state == VolumeState::Creating {
                volume.state = VolumeState::Available;
            }
            let finished_detach = match volume.attachment.as_mut() {
                Some(attachment) if attachment.state == AttachmentState::Attaching => {
                    attachment.state = AttachmentState::Attached;
                    false
                }
                Some(attachment) if attachment.state == AttachmentState::Detaching => true,
                _ => false,
            };
            if finished_detach {
                if let Some(attachment) = volume.attachment.take() {
                    detached.push((attachment.instance_id, id.clone()));
                }
                volume.state = VolumeState::Available;
            }
        }

        for (instance_id, volume_id) in detached {
            if let Some(instance) = state.instances.get_mut(&instance_id) {
                instance.volumes.retain(|v| v.volume_id != volume_id);
            }
        }

        Ok(described)
    }

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::AttachVolume)?;
        if !state.instances.contains_key(instance_id) {
            return Err(Error::NotFound(format!("Instance {}", instance_id)));
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("Volume {}", volume_id)))?;
        if volume.state != VolumeState::Available {
            return Err(Error::Upstream(format!(
                "IncorrectState: volume {} is {}",
                volume_id, volume.state
            )));
        }
        volume.state = VolumeState::InUse;
        volume.attachment = Some(SimAttachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            state: AttachmentState::Attaching,
        });

        state.instance_mut(instance_id)?.volumes.push(VolumeRef {
            volume_id: volume_id.to_string(),
            device_name: device.to_string(),
        });
        Ok(())
    }

    fn detach_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::DetachVolume)?;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("Volume {}", volume_id)))?;
        match volume.attachment.as_mut() {
            Some(attachment) => {
                attachment.state = AttachmentState::Detaching;
                Ok(())
            }
            None => Err(Error::Upstream(format!(
                "IncorrectState: volume {} is not attached",
                volume_id
            ))),
        }
    }

    fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::DeleteVolume)?;
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::NotFound(format!("Volume {}", volume_id)))?;
        if let Some(attachment) = &volume.attachment {
            return Err(Error::Upstream(format!(
                "VolumeInUse: volume {} is attached to {} at {}",
                volume_id, attachment.instance_id, attachment.device
            )));
        }
        state.volumes.remove(volume_id);
        Ok(())
    }
}

impl CommandChannel for InMemoryCloud {
    fn send_command(&self, instance_id: &str, command: &str) -> Result<String> {
        let mut state = self.state();
        state.enter(Operation::SendCommand)?;
        let running = state
            .instances
            .get(instance_id)
            .is_some_and(|i| i.power == PowerState::Running);
        if !running {
            return Err(Error::Upstream(format!(
                "InvalidInstanceId: instance {} is not in a valid state for commands",
                instance_id
            )));
        }

        let script = state
            .scripts
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| ScriptedCommand::success(""));

        let command_id = state.next_id("cmd");
        state.dispatched.push(command.to_string());
        state.invocations.insert(
            command_id.clone(),
            SimInvocation {
                instance_id: instance_id.to_string(),
                script,
            },
        );
        Ok(command_id)
    }

    fn get_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<Option<CommandInvocation>> {
        let mut state = self.state();
        state.enter(Operation::GetInvocation)?;
        let Some(invocation) = state.invocations.get_mut(command_id) else {
            return Ok(None);
        };
        if invocation.instance_id != instance_id {
            return Ok(None);
        }

        let script = &mut invocation.script;
        if script.not_found_polls > 0 {
            script.not_found_polls -= 1;
            return Ok(None);
        }
        let status = if script.pending_polls > 0 {
            script.pending_polls -= 1;
            InvocationStatus::Pending
        } else {
            script.status
        };

        Ok(Some(CommandInvocation {
            command_id: command_id.to_string(),
            status,
            stdout: script.stdout.clone(),
            stderr: script.stderr.clone(),
        }))
    }
}

impl ParameterStore for InMemoryCloud {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state();
        state.enter(Operation::GetParameter)?;
        Ok(state.parameters.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<bool> {
        let mut state = self.state();
        state.enter(Operation::PutParameter)?;
        if !overwrite && state.parameters.contains_key(key) {
            return Ok(false);
        }
        state.parameters.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::DeleteParameter)?;
        state.parameters.remove(key);
        Ok(())
    }
}

impl DnsUpdater for InMemoryCloud {
    fn update(&self, ip: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::UpdateDns)?;
        state.dns_records.push(ip.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_advances_through_pending() {
        let cloud = InMemoryCloud::new();
        cloud.add_instance("i-1", PowerState::Stopped, &["vol-1"]);
        cloud.start_instance("i-1").unwrap();

        let first = cloud.describe_instance("i-1").unwrap().unwrap();
        assert_eq!(first.power_state, PowerState::Pending);
        assert!(first.public_ip.is_none());

        let second = cloud.describe_instance("i-1").unwrap().unwrap();
        assert_eq!(second.power_state, PowerState::Running);
        assert_eq!(second.public_ip.as_deref(), Some("198.51.100.10"));
    }

    #[test]
    fn start_without_volume_is_rejected() {
        let cloud = InMemoryCloud::new();
        cloud.add_instance("i-1", PowerState::Stopped, &[]);
        assert!(cloud.start_instance("i-1").is_err());
    }

    #[test]
    fn delete_requires_detach() {
        let cloud = InMemoryCloud::new();
        cloud.add_instance("i-1", PowerState::Stopped, &["vol-1"]);
        assert!(cloud.delete_volume("vol-1").is_err());

        cloud.detach_volume("vol-1").unwrap();
        let ids = vec!["vol-1".to_string()];
        let detaching = cloud.describe_volumes(&ids).unwrap();
        assert_eq!(
            detaching[0].attachment_state,
            Some(AttachmentState::Detaching)
        );
        let detached = cloud.describe_volumes(&ids).unwrap();
        assert_eq!(detached[0].attachment_state, None);

        cloud.delete_volume("vol-1").unwrap();
        assert!(!cloud.volume_exists("vol-1"));
        let instance = cloud.describe_instance("i-1").unwrap().unwrap();
        assert!(instance.volumes.is_empty());
    }

    #[test]
    fn conditional_put_does_not_overwrite() {
        let cloud = InMemoryCloud::new();
        assert!(cloud.put("k", "a", false).unwrap());
        assert!(!cloud.put("k", "b", false).unwrap());
        assert_eq!(cloud.parameter("k").as_deref(), Some("a"));
        assert!(cloud.put("k", "b", true).unwrap());
        assert_eq!(cloud.parameter("k").as_deref(), Some("b"));
        cloud.delete("k").unwrap();
        cloud.delete("k").unwrap();
    }

    #[test]
    fn scripted_command_hides_then_completes() {
        let cloud = InMemoryCloud::new();
        cloud.add_instance("i-1", PowerState::Running, &["vol-1"]);
        cloud.script_command("backup", ScriptedCommand::success("OK").after_not_found(1));

        let id = cloud.send_command("i-1", "/opt/backup.sh").unwrap();
        assert!(cloud.get_invocation(&id, "i-1").unwrap().is_none());
        let done = cloud.get_invocation(&id, "i-1").unwrap().unwrap();
        assert_eq!(done.status, InvocationStatus::Success);
        assert_eq!(done.stdout, "OK");
    }

    #[test]
    fn device_names_continue_past_z() {
        assert_eq!(device_name(0), "/dev/xvda");
        assert_eq!(device_name(25), "/dev/xvdz");
        assert_eq!(device_name(26), "/dev/xvdaa");
        assert_eq!(device_name(27), "/dev/xvdab");
        assert_eq!(device_name(52), "/dev/xvdba");

        let cloud = InMemoryCloud::new();
        let ids: Vec<String> = (0..30).map(|i| format!("vol-{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        cloud.add_instance("i-1", PowerState::Stopped, &refs);
        let instance = cloud.describe_instance("i-1").unwrap().unwrap();
        assert_eq!(instance.volumes.len(), 30);
        assert_eq!(instance.volumes[29].device_name, "/dev/xvdad");
    }

    #[test]
    fn injected_failure_fires_once() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next(Operation::GetParameter, "throttled");
        assert!(cloud.get("k").is_err());
        assert!(cloud.get("k").unwrap().is_none());
        assert_eq!(cloud.calls(Operation::GetParameter), 2);
    }
}
