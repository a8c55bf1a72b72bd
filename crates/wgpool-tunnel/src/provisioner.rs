//! Tunnel bring-up and teardown with table-isolated routing
//!
//! A worker's tunnel never touches the main routing table: the rendered
//! configuration sets `Table = off` and installs a default route only in the
//! worker's own table, and a uid selector rule sends just that worker's
//! traffic into it.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wgpool_proto::{InventoryError, Lease, LinkInventory, RoutingIdentity, WorkerId};

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use crate::config::{TunnelConfig, TunnelOptions};

/// Default directory for tunnel configuration artifacts
pub const DEFAULT_CONFIG_DIR: &str = "/etc/wgpool/tunnels";

/// stderr fragments meaning the interface is already gone
const ALREADY_DOWN_MARKERS: &[&str] = &[
    "does not exist",
    "Cannot find device",
    "is not a WireGuard interface",
    "No such device",
];

/// stderr fragment `ip rule del` prints when the rule is absent
const RULE_MISSING_MARKER: &str = "No such file or directory";

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to run '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Tunnel config I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProvisioningError {
    /// Timeouts may succeed on retry, non-zero exits usually won't
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProvisioningError::Timeout { .. })
    }
}

impl From<CommandError> for ProvisioningError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Timeout { command, timeout } => {
                ProvisioningError::Timeout { command, timeout }
            }
            CommandError::Spawn { command, message } => {
                ProvisioningError::Spawn { command, message }
            }
        }
    }
}

/// Reachability probes exhausted without success
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{target} unreachable through {interface} after {attempts} probe(s)")]
pub struct VerificationError {
    pub interface: String,
    pub target: String,
    pub attempts: u32,
}

/// Outcome of the reachability probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Verified { attempts: u32 },
    Unverified(VerificationError),
    /// Probing disabled (`attempts == 0`)
    Skipped,
}

/// Reachability probe policy
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Address pinged through the tunnel
    pub target: String,
    /// Number of probes; the last one decides the outcome
    pub attempts: u32,
    /// Timeout of each probe command
    pub timeout: Duration,
    /// Pause after a successful probe
    pub success_interval: Duration,
    /// Pause after a failed probe
    pub retry_interval: Duration,
    /// Quiet period after verification, lets rule changes propagate
    pub settle: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            target: "8.8.8.8".to_string(),
            attempts: 3,
            timeout: Duration::from_secs(3),
            success_interval: Duration::from_millis(300),
            retry_interval: Duration::from_secs(1),
            settle: Duration::from_millis(500),
        }
    }
}

/// Provisioner configuration
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Directory holding `<interface>.conf` artifacts
    pub config_dir: PathBuf,
    /// Timeout applied to every tunnel and routing command
    pub command_timeout: Duration,
    pub tunnel: TunnelOptions,
    pub probe: ProbePolicy,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            command_timeout: Duration::from_secs(30),
            tunnel: TunnelOptions::default(),
            probe: ProbePolicy::default(),
        }
    }
}

/// A tunnel that finished bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTunnel {
    pub interface_name: String,
    pub config_path: PathBuf,
    pub reachability: Reachability,
}

/// Brings worker tunnels up and down
pub struct TunnelProvisioner {
    runner: Arc<dyn CommandRunner>,
    config: ProvisionerConfig,
}

impl TunnelProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ProvisionerConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Artifact path for a worker (`wg-quick` names the interface after the file)
    pub fn config_path(&self, identity: &RoutingIdentity) -> PathBuf {
        self.config
            .config_dir
            .join(format!("{}.conf", identity.interface_name))
    }

    async fn exec<I, S>(
        &self,
        program: &str,
        args: I,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisioningError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(program, args, timeout);
        Ok(self.runner.run(&spec).await?)
    }

    /// Run a command and turn a non-zero exit into [`ProvisioningError::CommandFailed`]
    async fn exec_checked<I, S>(
        &self,
        program: &str,
        args: I,
    ) -> Result<CommandOutput, ProvisioningError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(program, args, self.config.command_timeout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(ProvisioningError::CommandFailed {
                command: spec.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Bring up a worker's tunnel from a leased key
    ///
    /// On a hard failure nothing is left behind: no routing rule, no
    /// artifact, no interface. Failed reachability probes are reported in
    /// [`ActiveTunnel::reachability`] rather than as an error.
    pub async fn bring_up(
        &self,
        lease: &Lease,
        identity: &RoutingIdentity,
    ) -> Result<ActiveTunnel, ProvisioningError> {
        let interface = &identity.interface_name;
        let config_path = self.config_path(identity);

        if self.is_live(interface).await? {
            warn!(
                interface = %interface,
                "Interface already up without a connection record, tearing it down first"
            );
            self.bring_down(identity, &config_path).await?;
        }

        let config = TunnelConfig::for_lease(lease, identity, &self.config.tunnel);
        write_artifact(&self.config.config_dir, &config_path, &config.render())?;
        debug!(path = ?config_path, table = identity.table_id, "Wrote tunnel config");

        let path_arg = config_path.display().to_string();
        if let Err(e) = self.exec_checked("wg-quick", ["up", path_arg.as_str()]).await {
            error!(interface = %interface, error = %e, "Tunnel activation failed");
            self.discard_link(interface).await;
            remove_artifact(&config_path);
            return Err(e);
        }

        if let Err(e) = self.install_rule(identity).await {
            error!(interface = %interface, error = %e, "Routing rule installation failed");
            if let Err(down) = self
                .exec(
                    "wg-quick",
                    ["down", path_arg.as_str()],
                    self.config.command_timeout,
                )
                .await
            {
                warn!(interface = %interface, error = %down, "Rollback of tunnel failed");
            }
            self.discard_link(interface).await;
            remove_artifact(&config_path);
            return Err(e);
        }

        info!(
            interface = %interface,
            table = identity.table_id,
            owner = identity.owner_id,
            priority = identity.rule_priority,
            "✅ Tunnel up"
        );

        let reachability = self.verify(identity).await;
        Ok(ActiveTunnel {
            interface_name: interface.clone(),
            config_path,
            reachability,
        })
    }

    /// Install the uid selector rule, replacing a stale duplicate
    async fn install_rule(&self, identity: &RoutingIdentity) -> Result<(), ProvisioningError> {
        let mut del = vec!["rule".to_string(), "del".to_string()];
        del.extend(identity.rule_selector());
        let stale = self.exec("ip", del, self.config.command_timeout).await?;
        if stale.success() {
            debug!(interface = %identity.interface_name, "Removed stale routing rule");
        }

        let mut add = vec!["rule".to_string(), "add".to_string()];
        add.extend(identity.rule_selector());
        self.exec_checked("ip", add).await?;
        Ok(())
    }

    /// Best-effort removal of a half-created interface
    async fn discard_link(&self, interface: &str) {
        match self
            .exec(
                "ip",
                ["link", "delete", "dev", interface],
                self.config.command_timeout,
            )
            .await
        {
            Ok(output) if output.success() => {
                debug!(interface = %interface, "Removed half-created interface")
            }
            Ok(_) => {}
            Err(e) => warn!(interface = %interface, error = %e, "Failed to remove interface"),
        }
    }

    /// Ping through the tunnel until the probe budget is spent
    ///
    /// Early failures only mean routes are still settling; the last probe
    /// decides the outcome.
    pub async fn verify(&self, identity: &RoutingIdentity) -> Reachability {
        let policy = &self.config.probe;
        if policy.attempts == 0 {
            return Reachability::Skipped;
        }

        let interface = &identity.interface_name;
        let mut last_ok = false;

        for attempt in 1..=policy.attempts {
            last_ok = match self
                .exec(
                    "ping",
                    ["-c", "1", "-W", "2", "-I", interface.as_str(), policy.target.as_str()],
                    policy.timeout,
                )
                .await
            {
                Ok(output) => output.success(),
                Err(e) => {
                    debug!(interface = %interface, error = %e, "Probe did not complete");
                    false
                }
            };

            if attempt < policy.attempts {
                if last_ok {
                    tokio::time::sleep(policy.success_interval).await;
                } else {
                    info!(
                        interface = %interface,
                        "⏳ Waiting for routes to settle ({}/{})",
                        attempt,
                        policy.attempts
                    );
                    tokio::time::sleep(policy.retry_interval).await;
                }
            }
        }

        if last_ok {
            tokio::time::sleep(policy.settle).await;
            info!(interface = %interface, "Reachability verified");
            Reachability::Verified {
                attempts: policy.attempts,
            }
        } else {
            let failure = VerificationError {
                interface: interface.clone(),
                target: policy.target.clone(),
                attempts: policy.attempts,
            };
            warn!(interface = %interface, "⚠️  {}", failure);
            Reachability::Unverified(failure)
        }
    }

    /// Tear down a worker's tunnel and routing rule
    ///
    /// Safe to call when the tunnel is already gone, which is what crash
    /// recovery needs. Every step is attempted; the first failure is returned.
    pub async fn bring_down(
        &self,
        identity: &RoutingIdentity,
        config_path: &Path,
    ) -> Result<(), ProvisioningError> {
        let interface = &identity.interface_name;
        let mut first_error: Option<ProvisioningError> = None;

        let link_result = if config_path.exists() {
            let path_arg = config_path.display().to_string();
            self.exec_tolerant(
                "wg-quick",
                vec!["down".to_string(), path_arg],
                ALREADY_DOWN_MARKERS,
            )
            .await
        } else {
            self.exec_tolerant(
                "ip",
                vec![
                    "link".to_string(),
                    "delete".to_string(),
                    "dev".to_string(),
                    interface.clone(),
                ],
                ALREADY_DOWN_MARKERS,
            )
            .await
        };
        if let Err(e) = link_result {
            warn!(interface = %interface, error = %e, "Tunnel deactivation failed");
            first_error.get_or_insert(e);
        }

        let mut del = vec!["rule".to_string(), "del".to_string()];
        del.extend(identity.rule_selector());
        if let Err(e) = self.exec_tolerant("ip", del, &[RULE_MISSING_MARKER]).await {
            warn!(interface = %interface, error = %e, "Routing rule removal failed");
            first_error.get_or_insert(e);
        }

        remove_artifact(config_path);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(interface = %interface, "Tunnel down");
                Ok(())
            }
        }
    }

    /// Run a command, treating failures whose stderr matches `tolerated` as success
    async fn exec_tolerant(
        &self,
        program: &str,
        args: Vec<String>,
        tolerated: &[&str],
    ) -> Result<(), ProvisioningError> {
        let spec = CommandSpec::new(program, args, self.config.command_timeout);
        let output = self.runner.run(&spec).await?;
        if output.success() {
            return Ok(());
        }
        if tolerated.iter().any(|marker| output.stderr.contains(marker)) {
            debug!(command = %spec, "Already removed");
            return Ok(());
        }
        Err(ProvisioningError::CommandFailed {
            command: spec.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }

    /// Live interfaces following the naming convention
    pub async fn live_interfaces(&self) -> Result<BTreeSet<String>, ProvisioningError> {
        let output = self.exec_checked("ip", ["-o", "link", "show"]).await?;
        Ok(parse_link_names(&output.stdout)
            .into_iter()
            .filter(|name| WorkerId::from_interface_name(name).is_some())
            .collect())
    }

    pub async fn is_live(&self, interface: &str) -> Result<bool, ProvisioningError> {
        Ok(self.live_interfaces().await?.contains(interface))
    }
}

#[async_trait]
impl LinkInventory for TunnelProvisioner {
    async fn live_interfaces(&self) -> Result<BTreeSet<String>, InventoryError> {
        TunnelProvisioner::live_interfaces(self)
            .await
            .map_err(|e| InventoryError(e.to_string()))
    }
}

/// Interface names from `ip -o link show` output
///
/// Lines look like `4: wg101: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 ...`;
/// a `name@parent` suffix is stripped.
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let index = parts.next()?.trim();
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let name = parts.next()?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Write an artifact readable by its owner only
fn write_artifact(dir: &Path, path: &Path, contents: &str) -> Result<(), ProvisioningError> {
    let io_error = |source: io::Error| ProvisioningError::Io {
        path: path.to_path_buf(),
        source,
    };

    create_private_dir(dir).map_err(|source| ProvisioningError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_error)?;
    }
    file.write_all(contents.as_bytes()).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = ?path, "Removed tunnel config"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove tunnel config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_names() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: enp4s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
7: wg101: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/none
9: veth0@if8: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP
";
        assert_eq!(
            parse_link_names(output),
            vec!["lo", "enp4s0", "wg101", "veth0"]
        );
    }

    #[test]
    fn test_parse_ignores_continuation_lines() {
        let output = "3: wgA: <POINTOPOINT> mtu 1420\n    link/none \n";
        assert_eq!(parse_link_names(output), vec!["wgA"]);
    }

    #[test]
    fn test_command_error_conversion() {
        let timeout: ProvisioningError = CommandError::Timeout {
            command: "wg-quick up x".to_string(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(timeout.is_timeout());

        let spawn: ProvisioningError = CommandError::Spawn {
            command: "wg-quick up x".to_string(),
            message: "not found".to_string(),
        }
        .into();
        assert!(!spawn.is_timeout());
    }

    #[cfg(unix)]
    #[test]
    fn test_artifact_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("tunnels");
        let path = dir.join("wg101.conf");

        write_artifact(&dir, &path, "[Interface]\n").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Interface]\n");

        remove_artifact(&path);
        assert!(!path.exists());
        // Removing twice is fine
        remove_artifact(&path);
    }
}
