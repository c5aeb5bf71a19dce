//! Configuration for the lifecycle orchestrator

use crate::error::{Error, Result};
use crate::poll::PollPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Everything the orchestrator needs to know about its environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instance targeted when a caller does not name one
    pub instance_id: Option<String>,
    pub region: String,
    /// Override for the compute control plane endpoint
    pub endpoint_url: Option<String>,
    /// Named credentials profile
    pub profile: Option<String>,
    /// Name filter for machine images that carry the data snapshot
    pub image_family: String,
    pub volume: VolumeConfig,
    pub polling: PollingConfig,
    /// Parameter store key holding the action lock record
    pub lock_key: String,
    /// Parameter store key holding the cached backup listing
    pub backup_list_key: String,
    pub scripts: ScriptConfig,
    pub dns: Option<DnsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub size_gib: u32,
    pub volume_type: String,
    pub device_name: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub power_state: PollPolicy,
    pub volume_available: PollPolicy,
    pub volume_attached: PollPolicy,
    pub volume_detached: PollPolicy,
    pub command: PollPolicy,
}

/// Shell commands run on the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Takes an optional backup name as its only argument
    pub backup: String,
    /// Takes the backup name to restore as its only argument
    pub restore: String,
    /// Prints one `name size date` line per backup
    pub list_backups: String,
    /// Must exit zero before a backup is attempted
    pub service_check: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub zone_id: String,
    pub record_id: String,
    pub record_name: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Falls back to `CLOUDFLARE_API_TOKEN` when unset
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_ttl() -> u32 {
    60
}

fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: None,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            profile: None,
            image_family: "game-server-*".to_string(),
            volume: VolumeConfig::default(),
            polling: PollingConfig::default(),
            lock_key: "/instance-lifecycle/action-lock".to_string(),
            backup_list_key: "/instance-lifecycle/backup-list".to_string(),
            scripts: ScriptConfig::default(),
            dns: None,
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            size_gib: 8,
            volume_type: "gp3".to_string(),
            device_name: "/dev/xvda".to_string(),
            encrypted: true,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            power_state: PollPolicy::new(Duration::from_secs(5), 60),
            volume_available: PollPolicy::new(Duration::from_secs(5), 60),
            volume_attached: PollPolicy::new(Duration::from_secs(2), 60),
            volume_detached: PollPolicy::new(Duration::from_secs(2), 30),
            command: PollPolicy::new(Duration::from_secs(2), 60),
        }
    }
}

impl PollingConfig {
    /// Same policy everywhere; handy for tests and simulations
    pub fn uniform(policy: PollPolicy) -> Self {
        Self {
            power_state: policy,
            volume_available: policy,
            volume_attached: policy,
            volume_detached: policy,
            command: policy,
        }
    }

    fn all(&self) -> [(&'static str, &PollPolicy); 5] {
        [
            ("power_state", &self.power_state),
            ("volume_available", &self.volume_available),
            ("volume_attached", &self.volume_attached),
            ("volume_detached", &self.volume_detached),
            ("command", &self.command),
        ]
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            backup: "/usr/local/bin/server-backup.sh".to_string(),
            restore: "/usr/local/bin/server-restore.sh".to_string(),
            list_backups: "/usr/local/bin/server-list-backups.sh".to_string(),
            service_check: None,
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Configuration(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("region", &self.region),
            ("image_family", &self.image_family),
            ("lock_key", &self.lock_key),
            ("backup_list_key", &self.backup_list_key),
            ("volume.volume_type", &self.volume.volume_type),
            ("volume.device_name", &self.volume.device_name),
            ("scripts.backup", &self.scripts.backup),
            ("scripts.restore", &self.scripts.restore),
            ("scripts.list_backups", &self.scripts.list_backups),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("{} must not be empty", field)));
            }
        }

        if self.volume.size_gib == 0 {
            return Err(Error::Configuration(
                "volume.size_gib must be at least 1".to_string(),
            ));
        }

        for (name, policy) in self.polling.all() {
            if policy.max_attempts == 0 {
                return Err(Error::Configuration(format!(
                    "polling.{}.max_attempts must be at least 1",
                    name
                )));
            }
        }

        if self.lock_key == self.backup_list_key {
            return Err(Error::Configuration(
                "lock_key and backup_list_key must differ".to_string(),
            ));
        }

        if let Some(dns) = &self.dns {
            for (field, value) in [
                ("dns.zone_id", &dns.zone_id),
                ("dns.record_id", &dns.record_id),
                ("dns.record_name", &dns.record_name),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Configuration(format!("{} must not be empty", field)));
                }
            }
        }

        Ok(())
    }

    /// Pick the explicit instance id, else the configured default
    pub fn resolve_instance(&self, explicit: Option<&str>) -> Result<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.instance_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::Configuration(
                    "no instance id given and none configured (instance_id)".to_string(),
                )
            })
    }

    /// Domain name published for the instance, if DNS is configured
    pub fn domain(&self) -> Option<&str> {
        self.dns.as_ref().map(|d| d.record_name.as_str())
    }
}
