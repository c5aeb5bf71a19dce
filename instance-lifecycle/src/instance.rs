//! Starting and stopping the instance

use crate::backend::ComputeApi;
use crate::error::{Error, Result};
use crate::poll::{poll_until, Poll, PollPolicy};
use crate::types::{InstanceDescriptor, PowerState};
use std::sync::Arc;
use tracing::info;

/// Issues power requests and waits for them to take effect.
///
/// Does not check volumes: the caller must make sure a volume is attached
/// before asking for a start.
#[derive(Clone)]
pub struct InstanceController {
    compute: Arc<dyn ComputeApi>,
    policy: PollPolicy,
}

/// States from which `target` can no longer be reached
fn is_dead_end(current: &PowerState, target: &PowerState) -> bool {
    match target {
        PowerState::Running => matches!(
            current,
            PowerState::Terminated | PowerState::ShuttingDown | PowerState::Stopped
        ),
        PowerState::Stopped => {
            matches!(current, PowerState::Terminated | PowerState::ShuttingDown)
        }
        _ => matches!(current, PowerState::Terminated),
    }
}

impl InstanceController {
    pub fn new(compute: Arc<dyn ComputeApi>, policy: PollPolicy) -> Self {
        Self { compute, policy }
    }

    pub fn start(&self, instance_id: &str) -> Result<()> {
        info!(instance_id, "starting instance");
        self.compute.start_instance(instance_id)
    }

    pub fn stop(&self, instance_id: &str) -> Result<()> {
        info!(instance_id, "stopping instance");
        self.compute.stop_instance(instance_id)
    }

    /// Poll until the instance reports `target`, returning that observation.
    ///
    /// A stopped instance while waiting for `running` is only a dead end once
    /// it has been seen leaving `stopped`; the first reads after a start
    /// request may still show the old state.
    pub fn wait_for_power_state(
        &self,
        instance_id: &str,
        target: PowerState,
    ) -> Result<InstanceDescriptor> {
        let operation = format!("instance {} to be {}", instance_id, target);
        let mut left_initial = false;

        let instance = poll_until(&operation, &self.policy, || {
            let instance = self
                .compute
                .describe_instance(instance_id)?
                .ok_or_else(|| Error::NotFound(format!("Instance {}", instance_id)))?;
            let current = &instance.power_state;

            if *current == target {
                return Ok(Poll::Ready(instance));
            }
            let stale_stop = *current == PowerState::Stopped && !left_initial;
            if is_dead_end(current, &target) && !stale_stop {
                return Err(Error::UnexpectedState {
                    instance_id: instance_id.to_string(),
                    expected: target.to_string(),
                    actual: current.to_string(),
                });
            }
            if *current != PowerState::Stopped {
                left_initial = true;
            }
            Ok(Poll::Pending)
        })?;

        info!(instance_id, state = %target, "instance reached target state");
        Ok(instance)
    }
}
