//! Provider backend driven through the `aws` command line tool

use crate::backend::{CommandChannel, ComputeApi, ParameterStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{
    AttachmentState, CommandInvocation, ImageInfo, InstanceDescriptor, InvocationStatus,
    PowerState, VolumeDescriptor, VolumeRef, VolumeRequest, VolumeState,
};
use serde::Deserialize;
use std::io;
use std::process::Command;
use tracing::debug;

/// Configuration for the CLI backend
#[derive(Debug, Clone)]
pub struct AwsCliConfig {
    /// Program to invoke (e.g., aws)
    pub program: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub profile: Option<String>,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            profile: None,
        }
    }
}

impl From<&Config> for AwsCliConfig {
    fn from(config: &Config) -> Self {
        Self {
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            profile: config.profile.clone(),
            ..Self::default()
        }
    }
}

/// Compute, command and parameter-store backend
///
/// Every call shells out to the provider CLI with JSON output and parses the
/// response. Well-known "does not exist" error codes on stderr are turned into
/// absent values; any other failure is an upstream error.
pub struct AwsCliBackend {
    config: AwsCliConfig,
}

/// Error codes the CLI prints on stderr
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";
const INVOCATION_NOT_FOUND: &str = "InvocationDoesNotExist";
const PARAMETER_NOT_FOUND: &str = "ParameterNotFound";
const PARAMETER_EXISTS: &str = "ParameterAlreadyExists";

impl AwsCliBackend {
    pub fn new(config: AwsCliConfig) -> Self {
        Self { config }
    }

    /// Run the CLI and return stdout, or stderr on a non-zero exit
    fn invoke(&self, args: &[&str]) -> Result<std::result::Result<String, String>> {
        let mut command = Command::new(&self.config.program);
        command
            .args(args)
            .args(["--region", self.config.region.as_str(), "--output", "json"]);
        if let Some(endpoint) = &self.config.endpoint_url {
            command.args(["--endpoint-url", endpoint.as_str()]);
        }
        if let Some(profile) = &self.config.profile {
            command.args(["--profile", profile.as_str()]);
        }

        debug!(program = %self.config.program, ?args, "invoking provider cli");
        let output = command.output().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Configuration(format!("'{}' is not installed", self.config.program))
            } else {
                Error::Io(e)
            }
        })?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).to_string()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }

    /// Run the CLI, treating any failure as upstream
    fn run(&self, args: &[&str]) -> Result<String> {
        self.invoke(args)?
            .map_err(|stderr| upstream(args, &stderr))
    }

    /// Run the CLI, returning `None` when stderr names `absent_code`
    fn run_allowing(&self, args: &[&str], absent_code: &str) -> Result<Option<String>> {
        match self.invoke(args)? {
            Ok(stdout) => Ok(Some(stdout)),
            Err(stderr) if stderr.contains(absent_code) => Ok(None),
            Err(stderr) => Err(upstream(args, &stderr)),
        }
    }
}

fn upstream(args: &[&str], stderr: &str) -> Error {
    let operation = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
    Error::Upstream(format!("{}: {}", operation, stderr.trim()))
}

// === Response shapes ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    instance_id: String,
    state: RawInstanceState,
    public_ip_address: Option<String>,
    placement: RawPlacement,
    #[serde(default)]
    block_device_mappings: Vec<RawInstanceMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPlacement {
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstanceMapping {
    device_name: String,
    ebs: Option<RawInstanceEbs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstanceEbs {
    volume_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesOutput {
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    image_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    block_device_mappings: Vec<RawImageMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImageMapping {
    ebs: Option<RawImageEbs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImageEbs {
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateVolumeOutput {
    volume_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumesOutput {
    #[serde(default)]
    volumes: Vec<RawVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawVolume {
    volume_id: String,
    state: String,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawAttachment {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: RawCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCommand {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInvocation {
    command_id: String,
    status: String,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterOutput {
    parameter: RawParameter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawParameter {
    value: String,
}

// === Parsers ===

fn parse_instance(json: &str) -> Result<Option<InstanceDescriptor>> {
    let output: DescribeInstancesOutput = serde_json::from_str(json)?;
    let raw = output
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .next();

    Ok(raw.map(|raw| InstanceDescriptor {
        id: raw.instance_id,
        power_state: PowerState::parse(&raw.state.name),
        public_ip: raw.public_ip_address,
        volumes: raw
            .block_device_mappings
            .into_iter()
            .filter_map(|m| {
                m.ebs.map(|ebs| VolumeRef {
                    volume_id: ebs.volume_id,
                    device_name: m.device_name,
                })
            })
            .collect(),
        availability_zone: raw.placement.availability_zone,
    }))
}

fn parse_images(json: &str) -> Result<Vec<ImageInfo>> {
    let output: DescribeImagesOutput = serde_json::from_str(json)?;
    let mut images: Vec<ImageInfo> = output
        .images
        .into_iter()
        .map(|raw| ImageInfo {
            snapshot_id: raw
                .block_device_mappings
                .into_iter()
                .find_map(|m| m.ebs.and_then(|ebs| ebs.snapshot_id)),
            available: raw.state == "available",
            image_id: raw.image_id,
            name: raw.name,
            creation_date: raw.creation_date,
        })
        .collect();
    // ISO-8601 timestamps order lexically
    images.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
    Ok(images)
}

fn parse_volumes(json: &str) -> Result<Vec<VolumeDescriptor>> {
    let output: DescribeVolumesOutput = serde_json::from_str(json)?;
    Ok(output
        .volumes
        .into_iter()
        .map(|raw| VolumeDescriptor {
            id: raw.volume_id,
            state: VolumeState::parse(&raw.state),
            attachment_state: raw
                .attachments
                .first()
                .map(|a| AttachmentState::parse(&a.state)),
        })
        .collect())
}

fn parse_invocation(json: &str) -> Result<CommandInvocation> {
    let raw: RawInvocation = serde_json::from_str(json)?;
    Ok(CommandInvocation {
        command_id: raw.command_id,
        status: InvocationStatus::parse(&raw.status),
        stdout: raw.standard_output_content,
        stderr: raw.standard_error_content,
    })
}

impl ComputeApi for AwsCliBackend {
    fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDescriptor>> {
        let output = self.run_allowing(
            &["ec2", "describe-instances", "--instance-ids", instance_id],
            INSTANCE_NOT_FOUND,
        )?;
        match output {
            Some(json) => parse_instance(&json),
            None => Ok(None),
        }
    }

    fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "start-instances", "--instance-ids", instance_id])?;
        Ok(())
    }

    fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "stop-instances", "--instance-ids", instance_id])?;
        Ok(())
    }

    fn describe_images(&self, name_filter: &str) -> Result<Vec<ImageInfo>> {
        let filter = format!("Name=name,Values={}", name_filter);
        let json = self.run(&[
            "ec2",
            "describe-images",
            "--owners",
            "self",
            "--filters",
            filter.as_str(),
        ])?;
        parse_images(&json)
    }

    fn create_volume(&self, request: &VolumeRequest) -> Result<String> {
        let size = request.size_gib.to_string();
        let mut args = vec![
            "ec2",
            "create-volume",
            "--availability-zone",
            request.availability_zone.as_str(),
            "--snapshot-id",
            request.snapshot_id.as_str(),
            "--size",
            size.as_str(),
            "--volume-type",
            request.volume_type.as_str(),
        ];
        if request.encrypted {
            args.push("--encrypted");
        }
        let json = self.run(&args)?;
        let output: CreateVolumeOutput = serde_json::from_str(&json)?;
        Ok(output.volume_id)
    }

    fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>> {
        // One call per id so a deleted volume only drops itself from the result
        let mut volumes = Vec::new();
        for id in volume_ids {
            let output = self.run_allowing(
                &["ec2", "describe-volumes", "--volume-ids", id.as_str()],
                VOLUME_NOT_FOUND,
            )?;
            if let Some(json) = output {
                volumes.extend(parse_volumes(&json)?);
            }
        }
        Ok(volumes)
    }

    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.run(&[
            "ec2",
            "attach-volume",
            "--volume-id",
            volume_id,
            "--instance-id",
            instance_id,
            "--device",
            device,
        ])?;
        Ok(())
    }

    fn detach_volume(&self, volume_id: &str) -> Result<()> {
        self.run(&["ec2", "detach-volume", "--volume-id", volume_id])?;
        Ok(())
    }

    fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.run(&["ec2", "delete-volume", "--volume-id", volume_id])?;
        Ok(())
    }
}

impl CommandChannel for AwsCliBackend {
    fn send_command(&self, instance_id: &str, command: &str) -> Result<String> {
        let parameters = serde_json::json!({ "commands": [command] }).to_string();
        let json = self.run(&[
            "ssm",
            "send-command",
            "--instance-ids",
            instance_id,
            "--document-name",
            "AWS-RunShellScript",
            "--parameters",
            parameters.as_str(),
        ])?;
        let output: SendCommandOutput = serde_json::from_str(&json)?;
        Ok(output.command.command_id)
    }

    fn get_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<Option<CommandInvocation>> {
        let output = self.run_allowing(
            &[
                "ssm",
                "get-command-invocation",
                "--command-id",
                command_id,
                "--instance-id",
                instance_id,
            ],
            INVOCATION_NOT_FOUND,
        )?;
        output.map(|json| parse_invocation(&json)).transpose()
    }
}

impl ParameterStore for AwsCliBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let output = self.run_allowing(&["ssm", "get-parameter", "--name", key], PARAMETER_NOT_FOUND)?;
        match output {
            Some(json) => {
                let parsed: GetParameterOutput = serde_json::from_str(&json)?;
                Ok(Some(parsed.parameter.value))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<bool> {
        let mut args = vec![
            "ssm",
            "put-parameter",
            "--name",
            key,
            "--value",
            value,
            "--type",
            "String",
        ];
        if overwrite {
            args.push("--overwrite");
        }
        let written = self.run_allowing(&args, PARAMETER_EXISTS)?;
        Ok(written.is_some())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.run_allowing(&["ssm", "delete-parameter", "--name", key], PARAMETER_NOT_FOUND)?;
        Ok(())
    }
}
