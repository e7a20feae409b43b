use std::path::PathBuf;
use std::process::Stdio;
use async_trait::async_trait;
use serde::Deserialize;
use shared::types::MachineDetails;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use crate::config::ProviderConfig;
use super::{MachineSummary, ProviderError, VmOperation, VmProvider};

/// Drives machines through the gcloud CLI
pub struct GcloudProvider {
    bin: PathBuf,
    project: Option<String>,
}

#[derive(Deserialize)]
struct InstanceListing {
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDescription {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    machine_type: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    network_ip: String,
}

impl GcloudProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            bin: config.gcloud_bin.clone(),
            project: config.project.clone(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(project) = &self.project {
            cmd.arg("--project").arg(project);
        }
        // A timed-out call drops its future; the child must not outlive it.
        cmd.kill_on_drop(true).stdin(Stdio::null());
        cmd
    }

    fn display(&self, args: &[String]) -> String {
        format!("{} {}", self.bin.display(), args.join(" "))
    }

    async fn run(&self, args: Vec<String>) -> Result<String, ProviderError> {
        let command = self.display(&args);
        tracing::debug!("Executing command: {}", command);

        let output = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ProviderError::Unavailable {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                "{} failed: {}",
                command,
                stderr.lines().next().unwrap_or("no error output")
            );
            return Err(ProviderError::CommandFailed {
                command,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Last path segment of a resource URL, e.g. ".../zones/us-east4-a" -> "us-east4-a"
pub(crate) fn basename(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

pub(crate) fn parse_zone_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

pub(crate) fn parse_instances(command: &str, stdout: &str) -> Result<Vec<MachineSummary>, ProviderError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }

    let listings: Vec<InstanceListing> =
        serde_json::from_str(stdout).map_err(|e| ProviderError::Parse {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    Ok(listings
        .into_iter()
        .filter(|l| !l.name.is_empty())
        .map(|l| MachineSummary {
            zone: basename(&l.zone).to_string(),
            name: l.name,
            status: l.status,
        })
        .collect())
}

pub(crate) fn parse_description(
    command: &str,
    stdout: &str,
    zone: &str,
) -> Result<MachineDetails, ProviderError> {
    let desc: InstanceDescription =
        serde_json::from_str(stdout).map_err(|e| ProviderError::Parse {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    let or_unknown = |s: &str| if s.is_empty() { "unknown".to_string() } else { s.to_string() };

    Ok(MachineDetails {
        name: or_unknown(&desc.name),
        status: or_unknown(&desc.status),
        zone: zone.to_string(),
        machine_type: or_unknown(basename(&desc.machine_type)),
        network_ip: or_unknown(
            desc.network_interfaces
                .first()
                .map(|n| n.network_ip.as_str())
                .unwrap_or_default(),
        ),
    })
}

/// Forward non-empty lines to `progress`, returning them as well
async fn forward_lines<R>(reader: Option<R>, progress: Option<mpsc::Sender<String>>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut seen = Vec::new();
    let Some(reader) = reader else {
        return seen;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(tx) = &progress {
            // Receiver gone means the client disconnected; keep draining.
            let _ = tx.send(line.to_string()).await;
        }
        seen.push(line.to_string());
    }
    seen
}

#[async_trait]
impl VmProvider for GcloudProvider {
    fn name(&self) -> &'static str {
        "gcloud"
    }

    async fn list_zones(&self) -> Result<Vec<String>, ProviderError> {
        let stdout = self
            .run(args(["compute", "zones", "list", "--format=value(name)"]))
            .await?;
        Ok(parse_zone_list(&stdout))
    }

    async fn list_machines_in_zone(&self, zone: &str) -> Result<Vec<MachineSummary>, ProviderError> {
        let filter = format!("--filter=zone:({zone})");
        let argv = args(["compute", "instances", "list", filter.as_str(), "--format=json"]);
        let command = self.display(&argv);
        let stdout = self.run(argv).await?;

        let mut machines = parse_instances(&command, &stdout)?;
        for machine in &mut machines {
            if machine.zone.is_empty() {
                machine.zone = zone.to_string();
            }
        }
        Ok(machines)
    }

    async fn describe(&self, name: &str, zone: &str) -> Result<MachineDetails, ProviderError> {
        let argv = args(["compute", "instances", "describe", name, "--zone", zone, "--format=json"]);
        let command = self.display(&argv);
        let stdout = self.run(argv).await?;
        parse_description(&command, &stdout, zone)
    }

    async fn execute(
        &self,
        op: VmOperation,
        name: &str,
        zone: &str,
        progress: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        let argv = args(["compute", "instances", op.as_str(), name, "--zone", zone]);
        let command = self.display(&argv);
        tracing::info!("Executing command: {}", command);

        let mut child = self
            .command(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProviderError::Unavailable {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // stderr may carry project identifiers, so it is kept for the error path only.
        let (_, stderr_lines, status) = tokio::join!(
            forward_lines(stdout, Some(progress)),
            forward_lines(stderr, None),
            child.wait(),
        );

        let status = status.map_err(|source| ProviderError::Unavailable {
            command: command.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(ProviderError::CommandFailed {
                command,
                code: status.code(),
                stderr: stderr_lines.join("\n"),
            })
        }
    }
}
