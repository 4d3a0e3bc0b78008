// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::machine::MachineConfig;

/// Machine-authorization terminal.
#[derive(Debug, Parser)]
#[command(name = "latch", version, about)]
pub struct Config {
    /// Gateway WebSocket URL. TLS terminates in the platform link layer, so
    /// this is a plain `ws://` endpoint.
    #[arg(long, env = "LATCH_GATEWAY_URL", default_value = "ws://gateway.local:9000/terminal")]
    pub gateway_url: String,

    /// Terminal identity announced to the gateway.
    #[arg(long, env = "LATCH_TERMINAL_ID", default_value = "latch-0")]
    pub terminal_id: String,

    /// Serial device of the NFC front-end.
    #[arg(long, env = "LATCH_SERIAL", default_value = "/dev/ttyS1")]
    pub serial_port: PathBuf,

    /// Factory-data sector (gateway secret + terminal key).
    #[arg(long, env = "LATCH_FACTORY_SECTOR", default_value = "/var/lib/latch/factory.bin")]
    pub factory_sector: PathBuf,

    /// Device configuration document.
    #[arg(long, env = "LATCH_DEVICE_CONFIG", default_value = "/etc/latch/device-config.json")]
    pub device_config: PathBuf,

    /// Usage record spool.
    #[arg(long, env = "LATCH_USAGE_SPOOL", default_value = "/var/lib/latch/usage-spool.jsonl")]
    pub usage_spool: PathBuf,

    /// Relay GPIO value file.
    #[arg(long, env = "LATCH_RELAY_GPIO", default_value = "/sys/class/gpio/gpio18/value")]
    pub relay_gpio: PathBuf,

    /// Relay wiring is active-low.
    #[arg(long, env = "LATCH_RELAY_ACTIVE_LOW")]
    pub relay_active_low: bool,

    /// Which machine binding this terminal drives (default: the first).
    #[arg(long, env = "LATCH_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// Usage upload batch size.
    #[arg(long, env = "LATCH_USAGE_BATCH", default_value = "16")]
    pub usage_batch: usize,

    /// Idle flush interval for pending usage records, seconds.
    #[arg(long, env = "LATCH_USAGE_FLUSH_SECS", default_value = "30")]
    pub usage_flush_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "LATCH_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LATCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.log_format.as_str(), "json" | "text") {
            bail!("--log-format must be json or text, got {:?}", self.log_format);
        }
        if self.usage_batch == 0 {
            bail!("--usage-batch must be at least 1");
        }
        if self.usage_flush_secs == 0 {
            bail!("--usage-flush-secs must be at least 1");
        }
        Ok(())
    }
}

// -- Device configuration -----------------------------------------------------

/// Synced device config: machine bindings and the SDM host. Delivered
/// out-of-band; a version change triggers a controlled restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub version: u64,
    /// Host baked into personalized SDM URLs.
    pub sdm_host: String,
    pub machines: Vec<MachineBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineBinding {
    pub machine_id: String,
    pub display_name: String,
    pub required_permission: String,
    pub activation_timeout_secs: u64,
}

impl MachineBinding {
    pub fn to_machine_config(&self) -> MachineConfig {
        MachineConfig {
            machine_id: self.machine_id.clone(),
            display_name: self.display_name.clone(),
            required_permission: self.required_permission.clone(),
            activation_timeout: Duration::from_secs(self.activation_timeout_secs),
        }
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading device config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing device config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.machines.is_empty() {
            bail!("device config has no machine bindings");
        }
        for binding in &self.machines {
            if binding.machine_id.is_empty() {
                bail!("machine binding with empty machine_id");
            }
            if binding.activation_timeout_secs == 0 {
                bail!("machine {} has a zero activation timeout", binding.machine_id);
            }
        }
        let mut ids: Vec<&str> = self.machines.iter().map(|m| m.machine_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.machines.len() {
            bail!("duplicate machine ids in device config");
        }
        Ok(())
    }

    /// The binding this terminal drives.
    pub fn binding_for(&self, machine_id: Option<&str>) -> anyhow::Result<&MachineBinding> {
        match machine_id {
            None => Ok(&self.machines[0]),
            Some(id) => self
                .machines
                .iter()
                .find(|m| m.machine_id == id)
                .with_context(|| format!("machine {id} not in device config")),
        }
    }
}

/// Watch the device-config file; when its version changes, trigger the
/// restart token. The returned watcher must stay alive.
pub fn watch_device_config(
    path: PathBuf,
    current_version: u64,
    restart: CancellationToken,
) -> anyhow::Result<notify::RecommendedWatcher> {
    let watched = path.clone();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let Ok(event) = event else { return };
        if !matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_) | notify::EventKind::Any
        ) {
            return;
        }
        match DeviceConfig::load(&watched) {
            Ok(config) if config.version != current_version => {
                info!(
                    old = current_version,
                    new = config.version,
                    "device config changed; requesting restart"
                );
                restart.cancel();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "device config rewrite is unreadable; ignoring"),
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// How often the gateway is asked for a newer device config.
const CONFIG_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

/// Keep the on-disk device config in sync with the gateway. A newer version
/// is validated, written to disk, and picked up by the file watcher, which
/// turns it into a controlled restart.
pub async fn sync_device_config(
    gateway: std::sync::Arc<crate::gateway::Gateway>,
    path: PathBuf,
    current_version: u64,
    stop: CancellationToken,
) {
    use crate::gateway::rpc::{method, ConfigFetchRequest, ConfigFetchResponse};

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(CONFIG_POLL_INTERVAL) => {}
        }
        let response: ConfigFetchResponse = match gateway
            .call(method::CONFIG_FETCH, &ConfigFetchRequest {}, std::time::Duration::from_secs(10))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "device config poll failed");
                continue;
            }
        };
        if response.version <= current_version {
            continue;
        }
        let parsed: Result<DeviceConfig, _> = serde_json::from_value(response.config.clone());
        match parsed.map_err(anyhow::Error::from).and_then(|c| c.validate().map(|()| c)) {
            Ok(_) => {
                let body = match serde_json::to_string_pretty(&response.config) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "device config serialization failed");
                        continue;
                    }
                };
                if let Err(e) = std::fs::write(&path, body) {
                    warn!(error = %e, "device config write failed");
                } else {
                    info!(version = response.version, "newer device config persisted");
                }
            }
            Err(e) => warn!(error = %e, version = response.version, "rejected device config from gateway"),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
