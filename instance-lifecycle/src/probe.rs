//! Deriving the canonical server state from what the control plane reports

use crate::backend::ComputeApi;
use crate::error::{Error, Result};
use crate::types::{InstanceDescriptor, PowerState, ServerState};
use std::sync::Arc;

/// Map a raw power state and the number of attached volumes to a [`ServerState`].
///
/// A stopped instance without volumes is hibernated; with volumes it is merely
/// stopped. A running instance without volumes can only be the result of
/// outside interference and reads as [`ServerState::Inconsistent`].
pub fn classify(power: &PowerState, volume_count: usize) -> ServerState {
    match power {
        PowerState::Stopped if volume_count == 0 => ServerState::Hibernated,
        PowerState::Stopped => ServerState::Stopped,
        PowerState::Running if volume_count == 0 => ServerState::Inconsistent,
        PowerState::Running => ServerState::Running,
        PowerState::Pending => ServerState::Pending,
        PowerState::Stopping => ServerState::Stopping,
        PowerState::Terminated => ServerState::Terminated,
        PowerState::ShuttingDown | PowerState::Other(_) => ServerState::Unknown,
    }
}

/// One observation of the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: ServerState,
    pub instance: InstanceDescriptor,
}

/// Reads the instance and classifies it; never mutates anything
#[derive(Clone)]
pub struct StateProbe {
    compute: Arc<dyn ComputeApi>,
}

impl StateProbe {
    pub fn new(compute: Arc<dyn ComputeApi>) -> Self {
        Self { compute }
    }

    pub fn probe(&self, instance_id: &str) -> Result<Observation> {
        let instance = self
            .compute
            .describe_instance(instance_id)?
            .ok_or_else(|| Error::NotFound(format!("Instance {}", instance_id)))?;
        let state = classify(&instance.power_state, instance.volumes.len());
        Ok(Observation { state, instance })
    }
}
