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
//! Packet captures, kernel probes and RTT monitoring as scoped background
//! processes.
//!
//! Remote tools stream to stdout over the SSH session, so their output lands
//! directly in the experiment's log directory and guard release only has to
//! stop the remote process and reap the local child. Captures are started
//! before the workload and stopped after it, enforced by acquisition order.

use std::{path::Path, process::Stdio, sync::Arc};

use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use crate::{
    error::Error,
    guard::{BackgroundProcessGuard, Guard},
    hosts::{Experiment, Host},
    remote::{run_local_command, ChildHandle, Executor},
};

pub struct CaptureAndMonitorManager {
    executor: Arc<dyn Executor>,
}

impl CaptureAndMonitorManager {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Start tcpdump on `host`, restricted to the experiment's flow ports,
    /// streaming the pcap into the experiment's log directory.
    pub async fn start_tcpdump(
        &self,
        host: &Host,
        role: &str,
        exp: &Experiment,
    ) -> Result<Box<dyn Guard>, Error> {
        let ports = exp
            .flows
            .iter()
            .map(|flow| format!("port {}", flow.server_port))
            .collect::<Vec<_>>()
            .join(" or ");
        let cmd = format!(
            "sudo tcpdump -n -s 65535 -i {} -w - {ports}",
            host.ifname_remote
        );
        let pcap = exp.log_dir().join(format!("{}-tcpdump-{role}.pcap", exp.name));
        let handle = self.executor.spawn_background(host, &cmd, &pcap).await?;
        log::info!("started tcpdump ({role}) on {}", host.ip_wan);
        Ok(Box::new(BackgroundProcessGuard::new(
            format!("tcpdump on {role}"),
            handle,
            Some((
                self.executor.clone(),
                host.clone(),
                "sudo pkill -SIGTERM tcpdump".to_string(),
            )),
        )))
    }

    /// Start the tcp_probe congestion-window probe on `host`, streaming the
    /// probe log into the experiment's log directory.
    pub async fn start_tcpprobe(
        &self,
        host: &Host,
        exp: &Experiment,
    ) -> Result<Box<dyn Guard>, Error> {
        let cmd = "sudo cat /proc/net/tcpprobe".to_string();
        let log = exp.log_dir().join(format!("{}-tcpprobe.log", exp.name));
        let handle = self.executor.spawn_background(host, &cmd, &log).await?;
        log::info!("started tcpprobe on {}", host.ip_wan);
        Ok(Box::new(BackgroundProcessGuard::new(
            "tcpprobe",
            handle,
            Some((
                self.executor.clone(),
                host.clone(),
                "sudo pkill -SIGTERM -f 'cat /proc/net/tcpprobe'".to_string(),
            )),
        )))
    }

    /// Start a local ping against `target_ip`, sampling the RTT for the whole
    /// experiment duration. Killed on guard release.
    pub fn start_rtt_monitor(
        &self,
        target_ip: &str,
        log: &Path,
    ) -> Result<Box<dyn Guard>, Error> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)?;
        let child = Command::new("ping")
            .args(["-D", "-i", "1", target_ip])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::null())
            .spawn()?;
        log::info!("started RTT monitor against {target_ip}");
        Ok(Box::new(BackgroundProcessGuard::new(
            format!("RTT monitor against {target_ip}"),
            Box::new(ChildHandle::new(child)),
            None,
        )))
    }
}

lazy_static! {
    static ref PING_AVG: Regex =
        Regex::new(r"min/avg/max/\w+ = [0-9.]+/(?P<avg>[0-9.]+)/").unwrap();
}

/// Measure the average RTT to `target_ip` with a short local ping burst.
pub async fn measure_rtt(target_ip: &str) -> Result<f64, Error> {
    let cmd = format!("ping -c 5 -i 0.2 {target_ip}");
    let output = run_local_command(&cmd).await?;
    parse_ping_avg(&output.stdout).ok_or_else(|| Error::InvalidConfig {
        field: "rtt",
        reason: format!("cannot parse ping output for {target_ip}"),
    })
}

fn parse_ping_avg(output: &str) -> Option<f64> {
    PING_AVG
        .captures(output)
        .and_then(|caps| caps.name("avg"))
        .and_then(|avg| avg.as_str().parse().ok())
}
