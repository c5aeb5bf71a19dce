//! Creating the data volume from a snapshot, and tearing it down again

use crate::backend::ComputeApi;
use crate::config::{PollingConfig, VolumeConfig};
use crate::error::{Error, Result};
use crate::poll::{poll_until, Poll, PollPolicy};
use crate::types::{
    AttachmentState, ImageInfo, InstanceDescriptor, VolumeDescriptor, VolumeRequest, VolumeState,
};
use std::sync::Arc;
use tracing::info;

/// What [`VolumeLifecycleManager::recover`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The instance already had volumes; nothing was touched
    AlreadyAttached { volume_ids: Vec<String> },
    Created {
        volume_id: String,
        image_id: String,
        snapshot_id: String,
    },
}

/// Recovery (create + attach) and teardown (detach + delete) of volumes
#[derive(Clone)]
pub struct VolumeLifecycleManager {
    compute: Arc<dyn ComputeApi>,
    image_family: String,
    volume: VolumeConfig,
    available: PollPolicy,
    attached: PollPolicy,
    detached: PollPolicy,
}

impl VolumeLifecycleManager {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        image_family: impl Into<String>,
        volume: VolumeConfig,
        polling: &PollingConfig,
    ) -> Self {
        Self {
            compute,
            image_family: image_family.into(),
            volume,
            available: polling.volume_available,
            attached: polling.volume_attached,
            detached: polling.volume_detached,
        }
    }

    /// Newest available image in the family that carries a storage snapshot
    pub fn latest_snapshot(&self) -> Result<(ImageInfo, String)> {
        let images = self.compute.describe_images(&self.image_family)?;
        images
            .into_iter()
            .rev()
            .filter(|image| image.available)
            .find_map(|image| image.snapshot_id.clone().map(|snap| (image, snap)))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Snapshot-bearing image matching '{}'",
                    self.image_family
                ))
            })
    }

    /// Give a volumeless instance a fresh volume from the latest snapshot.
    ///
    /// A no-op when the instance already has a volume. Once the volume exists,
    /// any later failure is reported as partial so the orphan is not hidden.
    pub fn recover(&self, instance: &InstanceDescriptor) -> Result<RecoveryOutcome> {
        if !instance.volumes.is_empty() {
            info!(instance_id = %instance.id, "volume already attached, nothing to recover");
            return Ok(RecoveryOutcome::AlreadyAttached {
                volume_ids: instance.volume_ids(),
            });
        }

        let (image, snapshot_id) = self.latest_snapshot()?;
        info!(image_id = %image.image_id, snapshot_id = %snapshot_id, "recovering volume from snapshot");

        let request = VolumeRequest {
            availability_zone: instance.availability_zone.clone(),
            snapshot_id: snapshot_id.clone(),
            size_gib: self.volume.size_gib,
            volume_type: self.volume.volume_type.clone(),
            encrypted: self.volume.encrypted,
        };
        let volume_id = self.compute.create_volume(&request)?;
        info!(volume_id = %volume_id, "volume created");

        self.attach_new(&volume_id, &instance.id)
            .map_err(|e| Error::partial(format!("volume {} was created", volume_id), e))?;

        Ok(RecoveryOutcome::Created {
            volume_id,
            image_id: image.image_id,
            snapshot_id,
        })
    }

    fn attach_new(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        self.wait_for_volume(
            &format!("volume {} to become available", volume_id),
            volume_id,
            &self.available,
            |volume| match volume {
                Some(v) if v.state == VolumeState::Available => Ok(true),
                Some(v) if v.state == VolumeState::Error => Err(Error::Upstream(format!(
                    "volume {} entered the error state",
                    v.id
                ))),
                _ => Ok(false),
            },
        )?;

        self.compute
            .attach_volume(volume_id, instance_id, &self.volume.device_name)?;
        info!(volume_id, instance_id, device = %self.volume.device_name, "attaching volume");

        self.wait_for_volume(
            &format!("volume {} to attach", volume_id),
            volume_id,
            &self.attached,
            |volume| {
                Ok(matches!(
                    volume.and_then(|v| v.attachment_state.as_ref()),
                    Some(AttachmentState::Attached)
                ))
            },
        )?;
        info!(volume_id, "volume attached");
        Ok(())
    }

    /// Detach and delete every volume on the instance, returning the deleted ids.
    ///
    /// Each volume is fully detached before its delete is issued. Stops at the
    /// first failure; if anything was already done the error is partial.
    pub fn teardown(&self, instance: &InstanceDescriptor) -> Result<Vec<String>> {
        let mut done: Vec<String> = Vec::new();
        let mut deleted = Vec::new();

        for volume in &instance.volumes {
            let id = volume.volume_id.as_str();
            let result = self.detach_and_delete(id, &mut done);
            if let Err(e) = result {
                if done.is_empty() {
                    return Err(e);
                }
                return Err(Error::partial(done.join(", "), e));
            }
            deleted.push(id.to_string());
        }

        Ok(deleted)
    }

    fn detach_and_delete(&self, volume_id: &str, done: &mut Vec<String>) -> Result<()> {
        info!(volume_id, "detaching volume");
        self.compute.detach_volume(volume_id)?;

        self.wait_for_volume(
            &format!("volume {} to detach", volume_id),
            volume_id,
            &self.detached,
            |volume| {
                Ok(matches!(
                    volume.map(|v| v.attachment_state.as_ref()),
                    None | Some(None) | Some(Some(AttachmentState::Detached))
                ))
            },
        )?;
        done.push(format!("volume {} detached", volume_id));

        self.compute.delete_volume(volume_id)?;
        info!(volume_id, "volume deleted");
        done.push(format!("volume {} deleted", volume_id));
        Ok(())
    }

    /// Poll one volume until `ready` says so. `ready` sees `None` when the
    /// volume is not (or no longer) listed.
    fn wait_for_volume<F>(
        &self,
        operation: &str,
        volume_id: &str,
        policy: &PollPolicy,
        ready: F,
    ) -> Result<()>
    where
        F: Fn(Option<&VolumeDescriptor>) -> Result<bool>,
    {
        let ids = [volume_id.to_string()];
        poll_until(operation, policy, || {
            let volumes = self.compute.describe_volumes(&ids)?;
            let volume = volumes.iter().find(|v| v.id == volume_id);
            Ok(if ready(volume)? {
                Poll::Ready(())
            } else {
                Poll::Pending
            })
        })
    }
}
