// CCTESTBED: Automated Congestion-Control Experiments on Controlled Network Testbeds
// Copyright (C) 2024-2025 The cctestbed developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Explicit configuration passed into each component. No process-wide mutable
//! state: everything the orchestrator varies lives in these structs.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::Error, hosts::Host};

/// Congestion-control algorithms exercised when none are selected explicitly.
pub const DEFAULT_CCALGS: &[&str] = &[
    "cubic",
    "reno",
    "bbr",
    "bic",
    "cdg",
    "highspeed",
    "htcp",
    "hybla",
    "illinois",
    "lp",
    "nv",
    "scalable",
    "vegas",
    "veno",
    "westwood",
    "yeah",
];

/// One bottleneck configuration to emulate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkCondition {
    /// Bottleneck bandwidth in Mbps.
    pub btlbw: u64,
    /// Target RTT in milliseconds.
    pub rtt: u64,
    /// Queue size in packets.
    pub queue_size: u64,
}

/// The network-condition matrix used when no conditions are given.
pub fn default_conditions() -> Vec<NetworkCondition> {
    [
        (5, 35, 16),
        (5, 85, 64),
        (5, 130, 64),
        (5, 275, 128),
        (10, 35, 32),
        (10, 85, 128),
        (10, 130, 128),
        (10, 275, 256),
        (15, 35, 64),
        (15, 85, 128),
        (15, 130, 256),
        (15, 275, 512),
    ]
    .into_iter()
    .map(|(btlbw, rtt, queue_size)| NetworkCondition {
        btlbw,
        rtt,
        queue_size,
    })
    .collect()
}

/// Load conditions from a headerless CSV of `btlbw,rtt,queue_size` rows.
pub fn load_conditions(path: &Path) -> Result<Vec<NetworkCondition>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut conditions = Vec::new();
    for record in reader.deserialize() {
        let (btlbw, rtt, queue_size): (u64, u64, u64) = record?;
        conditions.push(NetworkCondition {
            btlbw,
            rtt,
            queue_size,
        });
    }
    Ok(conditions)
}

/// The fixed machines of a testbed: server, client and the NAT relay in
/// front of the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestbedConfig {
    pub server: Host,
    pub client: Host,
    pub server_nat_ip: String,
}

impl TestbedConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: TestbedConfig = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.server.validate()?;
        config.client.validate()?;
        Ok(config)
    }
}

/// A bounded polling policy: `attempts` tries, `delay` apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl BackoffPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Control commands of the external shaping pipeline. The `{btlbw}` and
/// `{queue_size}` placeholders are substituted per experiment.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub start_cmd: String,
    pub status_cmd: String,
    pub stop_cmd: String,
    pub ready: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_cmd: "/opt/bess/bessctl/bessctl daemon start -- run port active-middlebox-pmd \
                        \"BESS_BTLBW={btlbw}, BESS_QUEUE_SIZE={queue_size}\""
                .to_string(),
            status_cmd: "/opt/bess/bessctl/bessctl show pipeline".to_string(),
            stop_cmd: "/opt/bess/bessctl/bessctl daemon stop".to_string(),
            ready: BackoffPolicy::new(10, Duration::from_secs(1)),
        }
    }
}

/// Knobs of the per-experiment driver.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Re-run experiments whose completion marker already exists.
    pub force: bool,
    /// Keep partial logs of failed experiments instead of deleting them.
    pub retain_logs: bool,
    /// Grace added on top of a flow's duration before the workload command is
    /// considered hung.
    pub flow_grace: Duration,
    /// Delay between spawning a flow's server process and connecting to it.
    pub server_settle: Duration,
    /// Sample RTT against the workload endpoint for the experiment duration.
    pub monitor_rtt: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            force: false,
            retain_logs: false,
            flow_grace: Duration::from_secs(30),
            server_settle: Duration::from_secs(1),
            monitor_rtt: true,
        }
    }
}

/// Settings of the cloud instance lifecycle.
#[derive(Clone, Debug)]
pub struct CloudConfig {
    /// Name filter selecting the base image when no region image exists yet.
    pub base_image_pattern: String,
    /// Key pairs managed by this tool are prefixed with this string.
    pub key_prefix: String,
    /// Login user on created instances.
    pub instance_username: String,
    /// Repository cloned during first-time provisioning.
    pub repo_url: String,
    /// Zones to force for regions whose default zone is known to be unusable.
    pub zone_overrides: Vec<(String, String)>,
    /// Polling budget for SSH readiness after boot.
    pub ssh_backoff: BackoffPolicy,
    /// Polling budget while waiting for an instance to stop.
    pub stop_backoff: BackoffPolicy,
    /// Settle delay after triggering a reboot, before reconnect polling.
    pub reboot_settle: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_image_pattern: "ubuntu/images/hvm-ssd/ubuntu-xenial-16.04-amd64-server-*"
                .to_string(),
            key_prefix: "cctestbed".to_string(),
            instance_username: "ubuntu".to_string(),
            repo_url: "https://github.com/cctestbed/cctestbed.git".to_string(),
            zone_overrides: vec![
                ("us-west-1".to_string(), "us-west-1c".to_string()),
                ("ap-northeast-1".to_string(), "ap-northeast-1c".to_string()),
            ],
            ssh_backoff: BackoffPolicy::new(30, Duration::from_secs(20)),
            stop_backoff: BackoffPolicy::new(60, Duration::from_secs(5)),
            reboot_settle: Duration::from_secs(60),
        }
    }
}
