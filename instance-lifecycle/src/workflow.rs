//! Lifecycle workflows: start, stop, hibernate, resume, backup, restore
//!
//! Every workflow checks its precondition with a plain probe first and rejects
//! without touching the lock. Only then does it take the action lock, probe
//! again under the lock, run its steps in order and release the lock on every
//! exit path. Nothing is rolled back automatically; a failure after a
//! destructive step is reported as partial.

use crate::backend::{CommandChannel, ComputeApi, DnsUpdater, ParameterStore};
use crate::command::RemoteCommandExecutor;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::instance::InstanceController;
use crate::lock::{LockManager, ParameterStoreLock};
use crate::probe::{Observation, StateProbe};
use crate::types::{
    ActionLockRecord, BackupEntry, BackupName, CachedBackupList, InstanceDescriptor, PowerState,
    ServerState,
};
use crate::volume::{RecoveryOutcome, VolumeLifecycleManager};
use chrono::Utc;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// The lock-serialized lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Hibernate,
    Resume,
    Backup,
    Restore,
}

impl Action {
    /// Name recorded in the action lock
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Hibernate => "hibernate",
            Action::Resume => "resume",
            Action::Backup => "backup",
            Action::Restore => "restore",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub instance_id: String,
    pub public_ip: String,
    pub domain: Option<String>,
    /// Set when the volume had to be recreated from a snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_volume: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HibernateOutcome {
    pub instance_id: String,
    pub already_hibernated: bool,
    pub backup_output: Option<String>,
    pub deleted_volumes: Vec<String>,
}

/// What happened to the optional restore step of a resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RestoreStatus {
    Skipped,
    #[serde(rename_all = "camelCase")]
    Succeeded { backup_name: String, output: String },
    #[serde(rename_all = "camelCase")]
    Failed { backup_name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub domain: Option<String>,
    pub already_running: bool,
    pub restore: RestoreStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub backup_name: Option<String>,
    pub output: String,
    pub listing_refreshed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub backup_name: String,
    pub output: String,
    pub dns_updated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub action: String,
    pub held_for_secs: i64,
}

/// Read-only view of the instance and the action lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub instance_id: String,
    pub state: ServerState,
    pub power_state: String,
    pub public_ip: Option<String>,
    pub volume_ids: Vec<String>,
    pub lock: Option<LockStatus>,
}

/// Result record handed to the web, email and CLI collaborators
///
/// Serializes as `{"success": true, "data": ..}` or
/// `{"success": false, "errorKind": .., "message": ..}`; the flag is derived
/// from the variant.
#[derive(Debug, Clone)]
pub enum WorkflowResponse<T> {
    Success {
        data: T,
    },
    Failure {
        error_kind: ErrorKind,
        message: String,
    },
}

impl<T> WorkflowResponse<T> {
    pub fn failure(err: &Error) -> Self {
        WorkflowResponse::Failure {
            error_kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkflowResponse::Success { .. })
    }

    /// HTTP status a web collaborator should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            WorkflowResponse::Success { .. } => 200,
            WorkflowResponse::Failure { error_kind, .. } => error_kind.http_status(),
        }
    }
}

impl<T: Serialize> Serialize for WorkflowResponse<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            WorkflowResponse::Success { data } => {
                let mut state = serializer.serialize_struct("WorkflowResponse", 2)?;
                state.serialize_field("success", &true)?;
                state.serialize_field("data", data)?;
                state.end()
            }
            WorkflowResponse::Failure {
                error_kind,
                message,
            } => {
                let mut state = serializer.serialize_struct("WorkflowResponse", 3)?;
                state.serialize_field("success", &false)?;
                state.serialize_field("errorKind", error_kind)?;
                state.serialize_field("message", message)?;
                state.end()
            }
        }
    }
}

impl<T> From<Result<T>> for WorkflowResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => WorkflowResponse::Success { data },
            Err(e) => WorkflowResponse::failure(&e),
        }
    }
}

/// Control-plane clients the orchestrator drives
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeApi>,
    pub commands: Arc<dyn CommandChannel>,
    pub store: Arc<dyn ParameterStore>,
    pub dns: Option<Arc<dyn DnsUpdater>>,
}

impl Backends {
    /// Use one object for every plane, e.g. [`crate::backend::InMemoryCloud`]
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: ComputeApi + CommandChannel + ParameterStore + DnsUpdater + 'static,
    {
        Self {
            compute: backend.clone(),
            commands: backend.clone(),
            store: backend.clone(),
            dns: Some(backend),
        }
    }
}

/// Composes probe, lock, instance, volume, command and DNS steps into workflows
pub struct Orchestrator {
    config: Config,
    probe: StateProbe,
    lock: Arc<dyn LockManager>,
    executor: RemoteCommandExecutor,
    volumes: VolumeLifecycleManager,
    instances: InstanceController,
    store: Arc<dyn ParameterStore>,
    dns: Option<Arc<dyn DnsUpdater>>,
}

/// Fold what already happened into an error, flattening nested partials
fn after(completed: &str, err: Error) -> Error {
    match err {
        Error::Partial {
            completed: inner,
            source,
        } => Error::partial(format!("{}, {}", completed, inner), *source),
        other => Error::partial(completed, other),
    }
}

/// Parse `name size date...` lines; anything shorter is skipped
pub fn parse_backup_listing(stdout: &str) -> Vec<BackupEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                Some(BackupEntry {
                    name: parts[0].to_string(),
                    size: parts[1].to_string(),
                    date: parts[2..].join(" "),
                })
            } else {
                None
            }
        })
        .collect()
}

fn with_argument(script: &str, name: Option<&BackupName>) -> String {
    match name {
        Some(name) => format!("{} {}", script, name),
        None => script.to_string(),
    }
}

fn parse_backup_name(name: Option<&str>) -> Result<Option<BackupName>> {
    name.map(|n| BackupName::new(n).map_err(Error::InvalidState))
        .transpose()
}

impl Orchestrator {
    /// Build an orchestrator whose action lock lives in the parameter store
    pub fn new(config: Config, backends: Backends) -> Result<Self> {
        let lock = Arc::new(ParameterStoreLock::new(
            backends.store.clone(),
            config.lock_key.clone(),
        ));
        Self::with_lock(config, backends, lock)
    }

    pub fn with_lock(
        config: Config,
        backends: Backends,
        lock: Arc<dyn LockManager>,
    ) -> Result<Self> {
        config.validate()?;
        let polling = &config.polling;
        Ok(Self {
            probe: StateProbe::new(backends.compute.clone()),
            executor: RemoteCommandExecutor::new(backends.commands, polling.command),
            volumes: VolumeLifecycleManager::new(
                backends.compute.clone(),
                config.image_family.clone(),
                config.volume.clone(),
                polling,
            ),
            instances: InstanceController::new(backends.compute, polling.power_state),
            store: backends.store,
            dns: backends.dns,
            lock,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn domain(&self) -> Option<String> {
        self.config.domain().map(str::to_string)
    }

    /// Reject `observation` unless its state is one of `allowed`
    fn require(
        &self,
        action: Action,
        observation: &Observation,
        allowed: &[ServerState],
    ) -> Result<()> {
        if allowed.contains(&observation.state) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(ServerState::as_str)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(Error::InvalidState(format!(
            "Cannot {} instance {}: it is {} (expected {})",
            action, observation.instance.id, observation.state, expected
        )))
    }

    /// Hold the action lock around `steps`, re-checking the precondition
    /// once the lock is ours. The lock is released on every exit path.
    fn run_locked<T, F>(
        &self,
        action: Action,
        instance_id: &str,
        allowed: &[ServerState],
        steps: F,
    ) -> Result<T>
    where
        F: FnOnce(&Observation) -> Result<T>,
    {
        self.lock.acquire(action.as_str())?;
        info!(%action, instance_id, "workflow started");

        let result = self
            .probe
            .probe(instance_id)
            .and_then(|observation| {
                self.require(action, &observation, allowed)?;
                Ok(observation)
            })
            .and_then(|observation| steps(&observation));

        if let Err(e) = self.lock.release() {
            warn!(%action, error = %e, "failed to release action lock");
        }

        match &result {
            Ok(_) => info!(%action, instance_id, "workflow finished"),
            Err(e) => warn!(%action, instance_id, error = %e, "workflow failed"),
        }
        result
    }

    /// Recover the volume if needed, start, wait for running and publish DNS
    fn bring_up(&self, observation: &Observation) -> Result<(InstanceDescriptor, Option<String>)> {
        let instance_id = observation.instance.id.as_str();
        let recovered = match self.volumes.recover(&observation.instance)? {
            RecoveryOutcome::Created { volume_id, .. } => Some(volume_id),
            RecoveryOutcome::AlreadyAttached { .. } => None,
        };

        let started = self
            .instances
            .start(instance_id)
            .and_then(|_| {
                self.instances
                    .wait_for_power_state(instance_id, PowerState::Running)
            })
            .map_err(|e| match &recovered {
                Some(volume_id) => after(&format!("volume {} was recovered", volume_id), e),
                None => e,
            })?;

        let ip = started.public_ip.clone().ok_or_else(|| {
            Error::partial(
                format!("instance {} is running", instance_id),
                Error::Upstream("no public IP was assigned".to_string()),
            )
        })?;

        if let Some(dns) = &self.dns {
            dns.update(&ip)
                .map_err(|e| after(&format!("instance {} is running at {}", instance_id, ip), e))?;
        }

        Ok((started, recovered))
    }

    // === Workflows ===

    pub fn start(&self, instance_id: &str) -> Result<StartOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Stopped, ServerState::Hibernated];
        let observation = self.probe.probe(instance_id)?;
        if observation.state == ServerState::Running {
            return Err(Error::InvalidState(format!(
                "Instance {} is already running",
                instance_id
            )));
        }
        self.require(Action::Start, &observation, ALLOWED)?;

        self.run_locked(Action::Start, instance_id, ALLOWED, |observation| {
            let (instance, recovered) = self.bring_up(observation)?;
            Ok(StartOutcome {
                instance_id: instance.id,
                public_ip: instance.public_ip.unwrap_or_default(),
                domain: self.domain(),
                recovered_volume: recovered,
            })
        })
    }

    pub fn stop(&self, instance_id: &str) -> Result<StopOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Running];
        let observation = self.probe.probe(instance_id)?;
        self.require(Action::Stop, &observation, ALLOWED)?;

        self.run_locked(Action::Stop, instance_id, ALLOWED, |_| {
            self.instances.stop(instance_id)?;
            self.instances
                .wait_for_power_state(instance_id, PowerState::Stopped)?;
            Ok(StopOutcome {
                instance_id: instance_id.to_string(),
            })
        })
    }

    /// Back up, stop, then delete the volume so only the snapshot remains
    pub fn hibernate(&self, instance_id: &str) -> Result<HibernateOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Running];
        let observation = self.probe.probe(instance_id)?;
        if observation.state == ServerState::Hibernated {
            info!(instance_id, "already hibernated");
            return Ok(HibernateOutcome {
                instance_id: instance_id.to_string(),
                already_hibernated: true,
                backup_output: None,
                deleted_volumes: Vec::new(),
            });
        }
        self.require(Action::Hibernate, &observation, ALLOWED)?;

        self.run_locked(Action::Hibernate, instance_id, ALLOWED, |_| {
            let backup_output = self
                .executor
                .execute(instance_id, &self.config.scripts.backup)?;

            let stopped = self
                .instances
                .stop(instance_id)
                .and_then(|_| {
                    self.instances
                        .wait_for_power_state(instance_id, PowerState::Stopped)
                })
                .map_err(|e| after("backup completed", e))?;

            let deleted_volumes = self
                .volumes
                .teardown(&stopped)
                .map_err(|e| after(&format!("instance {} stopped", instance_id), e))?;

            Ok(HibernateOutcome {
                instance_id: instance_id.to_string(),
                already_hibernated: false,
                backup_output: Some(backup_output),
                deleted_volumes,
            })
        })
    }

    /// Bring a hibernated or stopped instance back, optionally restoring a backup
    pub fn resume(&self, instance_id: &str, restore: Option<&str>) -> Result<ResumeOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Hibernated, ServerState::Stopped];
        let restore = parse_backup_name(restore)?;
        let observation = self.probe.probe(instance_id)?;
        if observation.state == ServerState::Running {
            info!(instance_id, "already running");
            return Ok(ResumeOutcome {
                instance_id: instance_id.to_string(),
                public_ip: observation.instance.public_ip,
                domain: self.domain(),
                already_running: true,
                restore: RestoreStatus::Skipped,
            });
        }
        self.require(Action::Resume, &observation, ALLOWED)?;

        self.run_locked(Action::Resume, instance_id, ALLOWED, |observation| {
            let (instance, _) = self.bring_up(observation)?;

            let restore = match restore {
                None => RestoreStatus::Skipped,
                Some(name) => {
                    let command = with_argument(&self.config.scripts.restore, Some(&name));
                    match self.executor.execute(instance_id, &command) {
                        Ok(output) => RestoreStatus::Succeeded {
                            backup_name: name.to_string(),
                            output,
                        },
                        Err(e) => {
                            warn!(instance_id, backup = %name, error = %e, "restore after resume failed");
                            RestoreStatus::Failed {
                                backup_name: name.to_string(),
                                message: e.to_string(),
                            }
                        }
                    }
                }
            };

            Ok(ResumeOutcome {
                instance_id: instance.id,
                public_ip: instance.public_ip,
                domain: self.domain(),
                already_running: false,
                restore,
            })
        })
    }

    pub fn backup(&self, instance_id: &str, name: Option<&str>) -> Result<BackupOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Running];
        let name = parse_backup_name(name)?;
        let observation = self.probe.probe(instance_id)?;
        self.require(Action::Backup, &observation, ALLOWED)?;

        self.run_locked(Action::Backup, instance_id, ALLOWED, |_| {
            if let Some(check) = &self.config.scripts.service_check {
                self.executor.execute(instance_id, check)?;
            }

            let command = with_argument(&self.config.scripts.backup, name.as_ref());
            let output = self.executor.execute(instance_id, &command)?;

            let listing_refreshed = match self.store_backup_listing(instance_id) {
                Ok(listing) => {
                    info!(count = listing.backups.len(), "backup listing refreshed");
                    true
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "backup succeeded but listing refresh failed");
                    false
                }
            };

            Ok(BackupOutcome {
                backup_name: name.map(|n| n.to_string()),
                output,
                listing_refreshed,
            })
        })
    }

    /// Restore a backup on the running instance; defaults to the latest one
    pub fn restore(&self, instance_id: &str, name: Option<&str>) -> Result<RestoreOutcome> {
        const ALLOWED: &[ServerState] = &[ServerState::Running];
        let name = parse_backup_name(name)?.unwrap_or_else(BackupName::latest);
        let observation = self.probe.probe(instance_id)?;
        self.require(Action::Restore, &observation, ALLOWED)?;

        self.run_locked(Action::Restore, instance_id, ALLOWED, |observation| {
            let command = with_argument(&self.config.scripts.restore, Some(&name));
            let output = self.executor.execute(instance_id, &command)?;

            let dns_updated = match (&self.dns, &observation.instance.public_ip) {
                (Some(dns), Some(ip)) => match dns.update(ip) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(instance_id, error = %e, "restore succeeded but DNS update failed");
                        false
                    }
                },
                _ => false,
            };

            Ok(RestoreOutcome {
                backup_name: name.to_string(),
                output,
                dns_updated,
            })
        })
    }

    // === Read-only and operator operations ===

    pub fn status(&self, instance_id: &str) -> Result<StatusReport> {
        let observation = self.probe.probe(instance_id)?;
        let now = Utc::now();
        let lock = self.lock.current()?.map(|record| LockStatus {
            held_for_secs: record.age_secs(now),
            action: record.action,
        });
        Ok(StatusReport {
            instance_id: observation.instance.id.clone(),
            state: observation.state,
            power_state: observation.instance.power_state.to_string(),
            public_ip: observation.instance.public_ip.clone(),
            volume_ids: observation.instance.volume_ids(),
            lock,
        })
    }

    /// Cached backup listing, if one was ever stored
    pub fn list_backups(&self) -> Result<Option<CachedBackupList>> {
        match self.store.get(&self.config.backup_list_key)? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Ask the running instance for its backups and cache the answer
    pub fn refresh_backup_list(&self, instance_id: &str) -> Result<CachedBackupList> {
        let observation = self.probe.probe(instance_id)?;
        if observation.state != ServerState::Running {
            return Err(Error::InvalidState(format!(
                "Cannot list backups on instance {}: it is {}",
                instance_id, observation.state
            )));
        }
        self.store_backup_listing(instance_id)
    }

    fn store_backup_listing(&self, instance_id: &str) -> Result<CachedBackupList> {
        let stdout = self
            .executor
            .execute(instance_id, &self.config.scripts.list_backups)?;
        let listing = CachedBackupList {
            backups: parse_backup_listing(&stdout),
            cached_at: Utc::now(),
        };
        let value = serde_json::to_string(&listing)?;
        self.store.put(&self.config.backup_list_key, &value, true)?;
        Ok(listing)
    }

    /// Clear a lock left behind by a crashed workflow
    pub fn force_unlock(&self) -> Result<Option<ActionLockRecord>> {
        self.lock.force_release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Operation, ScriptedCommand};
    use crate::backend::InMemoryCloud;
    use crate::config::PollingConfig;
    use crate::lock::LocalLock;
    use crate::poll::PollPolicy;
    use crate::types::ImageInfo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Local lock that counts acquisition attempts and remembers actions
    #[derive(Default)]
    struct CountingLock {
        inner: LocalLock,
        acquires: AtomicU32,
        releases: AtomicU32,
    }

    impl LockManager for CountingLock {
        fn acquire(&self, action: &str) -> Result<()> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            self.inner.acquire(action)
        }

        fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release()
        }

        fn current(&self) -> Result<Option<ActionLockRecord>> {
            self.inner.current()
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.polling = PollingConfig::uniform(PollPolicy::new(Duration::ZERO, 10));
        config.scripts.backup = "/opt/backup.sh".to_string();
        config.scripts.restore = "/opt/restore.sh".to_string();
        config.scripts.list_backups = "/opt/list-backups.sh".to_string();
        config
    }

    fn setup(
        power: PowerState,
        volumes: &[&str],
    ) -> (Arc<InMemoryCloud>, Arc<CountingLock>, Orchestrator) {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_instance("i-1", power, volumes);
        cloud.add_image(ImageInfo {
            image_id: "ami-1".to_string(),
            name: "game-server-1".to_string(),
            creation_date: "2024-01-01T00:00:00Z".to_string(),
            available: true,
            snapshot_id: Some("snap-1".to_string()),
        });
        let lock = Arc::new(CountingLock::default());
        let orchestrator =
            Orchestrator::with_lock(config(), Backends::shared(cloud.clone()), lock.clone())
                .unwrap();
        (cloud, lock, orchestrator)
    }

    #[test]
    fn start_running_is_rejected_without_lock() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        let err = orchestrator.start("i-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
        assert_eq!(cloud.calls(Operation::StartInstance), 0);
    }

    #[test]
    fn start_with_volume_skips_recovery() {
        let (cloud, lock, orchestrator) = setup(PowerState::Stopped, &["vol-123"]);
        cloud.set_public_ip("i-1", "203.0.113.42");

        let outcome = orchestrator.start("i-1").unwrap();
        assert_eq!(outcome.public_ip, "203.0.113.42");
        assert_eq!(outcome.recovered_volume, None);
        assert_eq!(cloud.calls(Operation::CreateVolume), 0);
        assert_eq!(cloud.dns_updates(), vec!["203.0.113.42"]);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn start_hibernated_recovers_volume_first() {
        let (cloud, _, orchestrator) = setup(PowerState::Stopped, &[]);
        let outcome = orchestrator.start("i-1").unwrap();
        assert!(outcome.recovered_volume.is_some());
        assert_eq!(
            orchestrator.status("i-1").unwrap().state,
            ServerState::Running
        );
        assert_eq!(cloud.calls(Operation::CreateVolume), 1);
    }

    #[test]
    fn failure_after_lock_releases_it() {
        let (cloud, lock, orchestrator) = setup(PowerState::Stopped, &["vol-1"]);
        cloud.fail_next(Operation::StartInstance, "InsufficientInstanceCapacity");

        let err = orchestrator.start("i-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn held_lock_is_reported_as_conflict() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        lock.inner.acquire("backup").unwrap();

        let err = orchestrator.stop("i-1").unwrap_err();
        assert!(matches!(err, Error::LockConflict { ref action } if action == "backup"));
        assert_eq!(err.kind().http_status(), 409);
        assert_eq!(cloud.calls(Operation::StopInstance), 0);
        // The other workflow still owns it
        assert_eq!(lock.current().unwrap().unwrap().action, "backup");
    }

    /// Stops the instance behind the orchestrator's back while taking the lock
    struct InterferingLock {
        inner: LocalLock,
        cloud: Arc<InMemoryCloud>,
    }

    impl LockManager for InterferingLock {
        fn acquire(&self, action: &str) -> Result<()> {
            self.cloud.set_power_state("i-1", PowerState::Stopping);
            self.inner.acquire(action)
        }

        fn release(&self) -> Result<()> {
            self.inner.release()
        }

        fn current(&self) -> Result<Option<ActionLockRecord>> {
            self.inner.current()
        }
    }

    #[test]
    fn state_change_under_lock_is_invalid() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_instance("i-1", PowerState::Running, &["vol-1"]);
        let lock = Arc::new(InterferingLock {
            inner: LocalLock::new(),
            cloud: cloud.clone(),
        });
        let orchestrator =
            Orchestrator::with_lock(config(), Backends::shared(cloud.clone()), lock.clone())
                .unwrap();

        let err = orchestrator.stop("i-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("stopping"));
        assert_eq!(cloud.calls(Operation::StopInstance), 0);
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn probe_failure_is_not_swallowed() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.fail_next(Operation::DescribeInstance, "throttled");
        let err = orchestrator.stop("i-1").unwrap_err();
        assert_eq!(err.kind().http_status(), 500);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hibernate_already_hibernated_touches_nothing() {
        let (cloud, lock, orchestrator) = setup(PowerState::Stopped, &[]);
        let outcome = orchestrator.hibernate("i-1").unwrap();
        assert!(outcome.already_hibernated);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
        assert_eq!(cloud.calls(Operation::StopInstance), 0);
        assert_eq!(cloud.calls(Operation::DetachVolume), 0);
        assert_eq!(cloud.calls(Operation::SendCommand), 0);
    }

    #[test]
    fn hibernate_backs_up_stops_and_deletes() {
        let (cloud, _, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.script_command("/opt/backup.sh", ScriptedCommand::success("saved world"));

        let outcome = orchestrator.hibernate("i-1").unwrap();
        assert_eq!(outcome.backup_output.as_deref(), Some("saved world"));
        assert_eq!(outcome.deleted_volumes, vec!["vol-1"]);
        assert_eq!(
            orchestrator.status("i-1").unwrap().state,
            ServerState::Hibernated
        );
    }

    #[test]
    fn hibernate_backup_failure_leaves_instance_running() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.script_command("/opt/backup.sh", ScriptedCommand::failure("disk full"));

        let err = orchestrator.hibernate("i-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(cloud.calls(Operation::StopInstance), 0);
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn hibernate_delete_failure_is_partial() {
        let (cloud, _, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.fail_next(Operation::DeleteVolume, "DeleteVolume denied");

        let err = orchestrator.hibernate("i-1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "instance i-1 stopped, volume vol-1 detached, but Control plane error: DeleteVolume denied"
        );
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
    }

    #[test]
    fn resume_running_short_circuits() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.set_public_ip("i-1", "203.0.113.7");

        let outcome = orchestrator.resume("i-1", Some("nightly")).unwrap();
        assert!(outcome.already_running);
        assert_eq!(outcome.public_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(outcome.restore, RestoreStatus::Skipped);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resume_restore_failure_does_not_fail_resume() {
        let (cloud, _, orchestrator) = setup(PowerState::Stopped, &[]);
        cloud.script_command("/opt/restore.sh", ScriptedCommand::failure("corrupt archive"));

        let outcome = orchestrator.resume("i-1", Some("nightly")).unwrap();
        assert!(!outcome.already_running);
        match outcome.restore {
            RestoreStatus::Failed {
                backup_name,
                message,
            } => {
                assert_eq!(backup_name, "nightly");
                assert!(message.contains("corrupt archive"));
            }
            other => panic!("expected failed restore, got {other:?}"),
        }
        assert_eq!(
            cloud.dispatched_commands(),
            vec!["/opt/restore.sh nightly"]
        );
    }

    #[test]
    fn backup_refresh_failure_is_only_a_warning() {
        let (cloud, _, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.script_command("/opt/list-backups.sh", ScriptedCommand::failure("ls: denied"));

        let outcome = orchestrator.backup("i-1", Some("nightly-2024")).unwrap();
        assert!(!outcome.listing_refreshed);
        assert_eq!(outcome.backup_name.as_deref(), Some("nightly-2024"));
    }

    #[test]
    fn backup_runs_service_check_first() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_instance("i-1", PowerState::Running, &["vol-1"]);
        cloud.script_command("systemctl", ScriptedCommand::failure("inactive"));
        let mut config = config();
        config.scripts.service_check = Some("systemctl is-active game".to_string());
        let orchestrator = Orchestrator::with_lock(
            config,
            Backends::shared(cloud.clone()),
            Arc::new(LocalLock::new()),
        )
        .unwrap();

        let err = orchestrator.backup("i-1", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(cloud.dispatched_commands(), vec!["systemctl is-active game"]);
    }

    #[test]
    fn invalid_backup_name_rejected_before_lock() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        let err = orchestrator.backup("i-1", Some("x; reboot")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
        assert_eq!(cloud.calls(Operation::DescribeInstance), 0);
    }

    #[test]
    fn restore_defaults_to_latest_and_updates_dns() {
        let (cloud, _, orchestrator) = setup(PowerState::Running, &["vol-1"]);
        cloud.set_public_ip("i-1", "203.0.113.9");

        let outcome = orchestrator.restore("i-1", None).unwrap();
        assert_eq!(outcome.backup_name, "latest");
        assert!(outcome.dns_updated);
        assert_eq!(cloud.dispatched_commands(), vec!["/opt/restore.sh latest"]);
        assert_eq!(cloud.dns_updates(), vec!["203.0.113.9"]);
    }

    #[test]
    fn restore_on_stopped_instance_is_invalid() {
        let (_, lock, orchestrator) = setup(PowerState::Stopped, &["vol-1"]);
        let err = orchestrator.restore("i-1", Some("nightly")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inconsistent_instance_is_rejected_everywhere() {
        let (_, lock, orchestrator) = setup(PowerState::Running, &[]);
        assert_eq!(
            orchestrator.status("i-1").unwrap().state,
            ServerState::Inconsistent
        );
        assert_eq!(orchestrator.start("i-1").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(orchestrator.stop("i-1").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(orchestrator.hibernate("i-1").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(orchestrator.backup("i-1", None).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parses_listing_lines() {
        let listing = parse_backup_listing(
            "# name size date\nnightly-2024 1.2G 2024-05-01 03:00\n\nbroken-line\nweekly 800M 2024-04-28\n",
        );
        assert_eq!(
            listing,
            vec![
                BackupEntry {
                    name: "nightly-2024".to_string(),
                    size: "1.2G".to_string(),
                    date: "2024-05-01 03:00".to_string(),
                },
                BackupEntry {
                    name: "weekly".to_string(),
                    size: "800M".to_string(),
                    date: "2024-04-28".to_string(),
                },
            ]
        );
    }

    #[test]
    fn response_serializes_as_discriminated_union() {
        let ok: WorkflowResponse<StopOutcome> = Ok(StopOutcome {
            instance_id: "i-1".to_string(),
        })
        .into();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"success": true, "data": {"instanceId": "i-1"}})
        );

        let err: WorkflowResponse<StopOutcome> = Err(Error::LockConflict {
            action: "start".to_string(),
        })
        .into();
        assert_eq!(err.http_status(), 409);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({
                "success": false,
                "errorKind": "LockConflict",
                "message": "Another action is in progress: start"
            })
        );
    }

    #[test]
    fn success_flag_follows_variant() {
        let built: WorkflowResponse<()> = WorkflowResponse::Success { data: () };
        assert_eq!(serde_json::to_value(&built).unwrap()["success"], true);

        let failed = WorkflowResponse::<()>::failure(&Error::NotFound("Instance i-9".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorKind"], "NotFound");
        assert!(json.get("data").is_none());
        assert_eq!(failed.http_status(), 404);
    }

    #[test]
    fn stop_keeps_volume_and_releases_lock() {
        let (cloud, lock, orchestrator) = setup(PowerState::Running, &["vol-1"]);

        let outcome = orchestrator.stop("i-1").unwrap();
        assert_eq!(
            outcome,
            StopOutcome {
                instance_id: "i-1".to_string()
            }
        );

        let status = orchestrator.status("i-1").unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.volume_ids, vec!["vol-1"]);
        assert!(status.public_ip.is_none());
        assert_eq!(cloud.calls(Operation::StopInstance), 1);
        assert_eq!(cloud.calls(Operation::DetachVolume), 0);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(lock.current().unwrap().is_none());
    }
}
