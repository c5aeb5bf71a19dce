//! instance-lifecycle CLI - Start, stop, hibernate and back up the server instance

use clap::{Parser, Subcommand};
use colored::Colorize;
use instance_lifecycle::backend::aws_cli::AwsCliConfig;
use instance_lifecycle::backend::{AwsCliBackend, CloudflareDns};
use instance_lifecycle::{
    Backends, Config, DnsUpdater, Orchestrator, Result, ServerState, WorkflowResponse,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "/etc/instance-lifecycle.yaml";

#[derive(Parser)]
#[command(name = "instance-lifecycle")]
#[command(about = "Start, stop, hibernate and back up the server instance", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Instance to act on (defaults to instance_id from the config)
    #[arg(long, global = true)]
    instance_id: Option<String>,

    /// Print the structured result as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show instance state and the action lock
    Status,

    /// Start a stopped or hibernated instance
    Start,

    /// Stop a running instance, keeping its volume
    Stop,

    /// Back up, stop and delete the volume
    Hibernate,

    /// Bring a hibernated or stopped instance back
    Resume {
        /// Restore this backup once the instance is up
        #[arg(long)]
        restore: Option<String>,
    },

    /// Run the backup script on the running instance
    Backup {
        /// Name for the backup
        name: Option<String>,
    },

    /// Restore a backup on the running instance
    Restore {
        /// Backup to restore (default: latest)
        name: Option<String>,
    },

    /// Show the cached backup listing
    ListBackups {
        /// Ask the instance for a fresh listing first
        #[arg(long)]
        refresh: bool,
    },

    /// Clear an action lock left behind by a crashed workflow
    Unlock,
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Only the workflows that publish the instance address need DNS credentials
fn needs_dns(command: Option<&Commands>) -> bool {
    matches!(
        command,
        Some(Commands::Start | Commands::Resume { .. } | Commands::Restore { .. })
    )
}

fn build_orchestrator(config: Config, with_dns: bool) -> Result<Orchestrator> {
    let aws = Arc::new(AwsCliBackend::new(AwsCliConfig::from(&config)));
    let dns = match &config.dns {
        Some(dns) if with_dns => {
            Some(Arc::new(CloudflareDns::new(dns.clone())?) as Arc<dyn DnsUpdater>)
        }
        _ => None,
    };
    let backends = Backends {
        compute: aws.clone(),
        commands: aws.clone(),
        store: aws,
        dns,
    };
    Orchestrator::new(config, backends)
}

/// Print a workflow result either as JSON or through `describe`
fn report<T: Serialize>(json: bool, result: Result<T>, describe: impl FnOnce(&T)) -> Result<()> {
    match result {
        Ok(data) => {
            if json {
                let response: WorkflowResponse<&T> = Ok(&data).into();
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                describe(&data);
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let response = WorkflowResponse::<()>::failure(&e);
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            Err(e)
        }
    }
}

fn cmd_status(orchestrator: &Orchestrator, instance_id: &str, json: bool) -> Result<()> {
    report(json, orchestrator.status(instance_id), |status| {
        info(&format!("Instance {}", status.instance_id));
        println!();
        println!("  {:<12} {}", "STATE", status.state);
        println!("  {:<12} {}", "POWER", status.power_state);
        println!(
            "  {:<12} {}",
            "PUBLIC IP",
            status.public_ip.as_deref().unwrap_or("-")
        );
        let volumes = if status.volume_ids.is_empty() {
            "(none)".to_string()
        } else {
            status.volume_ids.join(", ")
        };
        println!("  {:<12} {}", "VOLUMES", volumes);
        println!();
        match &status.lock {
            Some(lock) => warn(&format!(
                "'{}' has held the action lock for {}s",
                lock.action, lock.held_for_secs
            )),
            None => info("No action in progress"),
        }
        if status.state == ServerState::Inconsistent {
            warn("Instance is running without a volume; it was changed outside this tool");
        }
    })
}

fn cmd_start(orchestrator: &Orchestrator, instance_id: &str, json: bool) -> Result<()> {
    if !json {
        info(&format!("Starting {}...", instance_id));
    }
    report(json, orchestrator.start(instance_id), |outcome| {
        if let Some(volume) = &outcome.recovered_volume {
            info(&format!("Recovered volume {} from snapshot", volume));
        }
        success(&format!(
            "{} is running at {}",
            outcome.instance_id, outcome.public_ip
        ));
        if let Some(domain) = &outcome.domain {
            info(&format!("DNS: {} -> {}", domain, outcome.public_ip));
        }
    })
}

fn cmd_stop(orchestrator: &Orchestrator, instance_id: &str, json: bool) -> Result<()> {
    if !json {
        info(&format!("Stopping {}...", instance_id));
    }
    report(json, orchestrator.stop(instance_id), |outcome| {
        success(&format!("{} stopped", outcome.instance_id));
    })
}

fn cmd_hibernate(orchestrator: &Orchestrator, instance_id: &str, json: bool) -> Result<()> {
    if !json {
        info(&format!("Hibernating {}...", instance_id));
    }
    report(json, orchestrator.hibernate(instance_id), |outcome| {
        if outcome.already_hibernated {
            info(&format!("{} is already hibernated", outcome.instance_id));
            return;
        }
        if let Some(output) = &outcome.backup_output {
            print!("{}", output);
        }
        success(&format!(
            "{} hibernated; deleted {}",
            outcome.instance_id,
            outcome.deleted_volumes.join(", ")
        ));
    })
}

fn cmd_resume(
    orchestrator: &Orchestrator,
    instance_id: &str,
    restore: Option<&str>,
    json: bool,
) -> Result<()> {
    use instance_lifecycle::workflow::RestoreStatus;

    if !json {
        info(&format!("Resuming {}...", instance_id));
    }
    report(json, orchestrator.resume(instance_id, restore), |outcome| {
        let ip = outcome.public_ip.as_deref().unwrap_or("-");
        if outcome.already_running {
            info(&format!("{} is already running at {}", outcome.instance_id, ip));
        } else {
            success(&format!("{} is running at {}", outcome.instance_id, ip));
        }
        match &outcome.restore {
            RestoreStatus::Skipped => {}
            RestoreStatus::Succeeded { backup_name, .. } => {
                success(&format!("Restored backup '{}'", backup_name))
            }
            RestoreStatus::Failed {
                backup_name,
                message,
            } => warn(&format!(
                "Restoring backup '{}' failed: {}",
                backup_name, message
            )),
        }
    })
}

fn cmd_backup(
    orchestrator: &Orchestrator,
    instance_id: &str,
    name: Option<&str>,
    json: bool,
) -> Result<()> {
    if !json {
        info(&format!("Backing up {}...", instance_id));
    }
    report(json, orchestrator.backup(instance_id, name), |outcome| {
        print!("{}", outcome.output);
        match &outcome.backup_name {
            Some(name) => success(&format!("Backup '{}' created", name)),
            None => success("Backup created"),
        }
        if !outcome.listing_refreshed {
            warn("Backup listing could not be refreshed");
        }
    })
}

fn cmd_restore(
    orchestrator: &Orchestrator,
    instance_id: &str,
    name: Option<&str>,
    json: bool,
) -> Result<()> {
    if !json {
        info(&format!(
            "Restoring '{}' on {}...",
            name.unwrap_or("latest"),
            instance_id
        ));
    }
    report(json, orchestrator.restore(instance_id, name), |outcome| {
        print!("{}", outcome.output);
        success(&format!("Backup '{}' restored", outcome.backup_name));
        if outcome.dns_updated {
            info("DNS record refreshed");
        }
    })
}

fn cmd_list_backups(
    orchestrator: &Orchestrator,
    instance_id: Option<&str>,
    refresh: bool,
    json: bool,
) -> Result<()> {
    let listing = if refresh {
        let instance_id = orchestrator.config().resolve_instance(instance_id)?;
        orchestrator.refresh_backup_list(&instance_id).map(Some)
    } else {
        orchestrator.list_backups()
    };

    report(json, listing, |listing| match listing {
        None => info("No backup listing cached yet (use --refresh)"),
        Some(listing) => {
            info(&format!("Backups (as of {}):", listing.cached_at.to_rfc3339()));
            println!();
            println!("  {:<30} {:<10} {}", "NAME", "SIZE", "DATE");
            println!("  {:<30} {:<10} {}", "----", "----", "----");
            for backup in &listing.backups {
                println!("  {:<30} {:<10} {}", backup.name, backup.size, backup.date);
            }
            if listing.backups.is_empty() {
                println!("  (no backups)");
            }
        }
    })
}

fn cmd_unlock(orchestrator: &Orchestrator, json: bool) -> Result<()> {
    report(json, orchestrator.force_unlock(), |cleared| match cleared {
        Some(record) => success(&format!("Cleared action lock held by '{}'", record.action)),
        None => info("Action lock was not held"),
    })
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_ref())?;
    let orchestrator = build_orchestrator(config, needs_dns(cli.command.as_ref()))?;
    let explicit = cli.instance_id.as_deref();
    let json = cli.json;
    let target = || orchestrator.config().resolve_instance(explicit);

    match cli.command {
        None | Some(Commands::Status) => cmd_status(&orchestrator, &target()?, json),
        Some(Commands::Start) => cmd_start(&orchestrator, &target()?, json),
        Some(Commands::Stop) => cmd_stop(&orchestrator, &target()?, json),
        Some(Commands::Hibernate) => cmd_hibernate(&orchestrator, &target()?, json),
        Some(Commands::Resume { restore }) => {
            cmd_resume(&orchestrator, &target()?, restore.as_deref(), json)
        }
        Some(Commands::Backup { name }) => {
            cmd_backup(&orchestrator, &target()?, name.as_deref(), json)
        }
        Some(Commands::Restore { name }) => {
            cmd_restore(&orchestrator, &target()?, name.as_deref(), json)
        }
        Some(Commands::ListBackups { refresh }) => {
            cmd_list_backups(&orchestrator, explicit, refresh, json)
        }
        Some(Commands::Unlock) => cmd_unlock(&orchestrator, json),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
