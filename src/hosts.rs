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
//! Value types describing the machines, flows and experiments of a testbed run.

use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A machine reachable over the network. Immutable once constructed, shared
/// read-only by all components addressing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Interface carrying experiment traffic on the machine itself.
    pub ifname_remote: String,
    /// Interface facing the machine on the testbed side.
    pub ifname_local: String,
    pub ip_lan: String,
    pub ip_wan: String,
    /// PCI address of the experiment NIC.
    pub pci: String,
    /// Private key used to open SSH sessions to this machine.
    pub key_filename: String,
    pub username: String,
}

impl Host {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ifname_remote: impl Into<String>,
        ifname_local: impl Into<String>,
        ip_lan: impl Into<String>,
        ip_wan: impl Into<String>,
        pci: impl Into<String>,
        key_filename: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<Self, Error> {
        let host = Self {
            ifname_remote: ifname_remote.into(),
            ifname_local: ifname_local.into(),
            ip_lan: ip_lan.into(),
            ip_wan: ip_wan.into(),
            pci: pci.into(),
            key_filename: key_filename.into(),
            username: username.into(),
        };
        host.validate()?;
        Ok(host)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (field, value) in [
            ("ip_lan", &self.ip_lan),
            ("ip_wan", &self.ip_wan),
            ("username", &self.username),
            ("key_filename", &self.key_filename),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One workload stream's parameters within an experiment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Congestion-control algorithm, e.g. `cubic` or `bbr`.
    pub ccalg: String,
    /// Offset from experiment start, in seconds.
    pub start_time: u64,
    pub end_time: u64,
    /// Target RTT to emulate, in milliseconds.
    pub rtt: u64,
    pub server_port: u16,
    pub client_port: u16,
    pub client_log: Option<PathBuf>,
    pub server_log: Option<PathBuf>,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ccalg: impl Into<String>,
        start_time: u64,
        end_time: u64,
        rtt: u64,
        server_port: u16,
        client_port: u16,
    ) -> Result<Self, Error> {
        let ccalg = ccalg.into();
        if ccalg.trim().is_empty() {
            return Err(Error::InvalidConfig {
                field: "ccalg",
                reason: "must not be empty".to_string(),
            });
        }
        if end_time <= start_time {
            return Err(Error::InvalidConfig {
                field: "end_time",
                reason: format!("must be after start_time ({start_time})"),
            });
        }
        if server_port == 0 || client_port == 0 {
            return Err(Error::InvalidConfig {
                field: "port",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(Self {
            ccalg,
            start_time,
            end_time,
            rtt,
            server_port,
            client_port,
            client_log: None,
            server_log: None,
        })
    }

    /// Duration of the flow in seconds.
    pub fn duration(&self) -> u64 {
        self.end_time - self.start_time
    }
}

/// The traffic driven between client and server while everything is measured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Workload {
    /// An iperf3 flow from the client against the NAT-relayed server address.
    Iperf,
    /// An HTTP download performed by the server, bound to its LAN address.
    Download { url: String },
}

/// The unit of work: one complete, named run of a network test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    /// Bottleneck bandwidth in Mbps.
    pub btlbw: u64,
    /// Shaping queue size in packets.
    pub queue_size: u64,
    pub flows: Vec<Flow>,
    pub server: Host,
    pub client: Host,
    /// WAN address of the NAT relay in front of the server.
    pub server_nat_ip: String,
    pub workload: Workload,
    /// Directory under which logs accumulate and archives are placed.
    pub data_dir: PathBuf,
}

impl Experiment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        btlbw: u64,
        queue_size: u64,
        flows: Vec<Flow>,
        server: Host,
        client: Host,
        server_nat_ip: impl Into<String>,
        workload: Workload,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if flows.is_empty() {
            return Err(Error::InvalidConfig {
                field: "flows",
                reason: "need at least one flow".to_string(),
            });
        }
        Ok(Self {
            name,
            btlbw,
            queue_size,
            flows,
            server,
            client,
            server_nat_ip: server_nat_ip.into(),
            workload,
            data_dir: data_dir.into(),
        })
    }

    /// Directory collecting this experiment's logs until they are archived.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    /// Flows ordered by their start offset.
    pub fn flows_in_start_order(&self) -> Vec<&Flow> {
        self.flows
            .iter()
            .sorted_by_key(|flow| flow.start_time)
            .collect()
    }

    /// The NAT relay addressed as a host. It shares credentials with the
    /// server, only its WAN address differs.
    pub fn nat_host(&self) -> Host {
        let mut host = self.server.clone();
        host.ip_wan = self.server_nat_ip.clone();
        host
    }

    /// The external address that the DNAT rule and static route apply to.
    pub fn external_ip(&self) -> &str {
        &self.client.ip_wan
    }
}
