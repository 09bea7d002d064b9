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
//! Transient network state: DNAT rules, static routes and hosts-file
//! overrides.
//!
//! Each operation captures the exact content it inserted and tears down by
//! content match, never by table position. Precondition of the calling
//! sequence: nothing else mutates the NAT table, routing table or hosts file
//! of the affected machines between setup and teardown. The rule tables are
//! exclusively owned by the currently running experiment on a given host.

use std::sync::Arc;

use crate::{
    error::Error,
    guard::{Guard, GuardStack, RemoteCommandGuard},
    hosts::{Experiment, Host, Workload},
    remote::Executor,
    util,
};

pub struct NetworkStateManager {
    executor: Arc<dyn Executor>,
}

impl NetworkStateManager {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Acquire all network state for `exp` in order DNAT -> route -> DNS and
    /// push the guards onto `stack`. Any setup failure propagates after the
    /// already-pushed guards were left on the stack for the caller to unwind.
    pub async fn configure(&self, exp: &Experiment, stack: &mut GuardStack) -> Result<(), Error> {
        let nat_host = exp.nat_host();
        stack.push(
            self.add_dnat_rule(&nat_host, exp.external_ip(), &exp.server.ip_lan)
                .await?,
        );
        stack.push(
            self.add_route(&exp.server, exp.external_ip(), &exp.client.ip_lan)
                .await?,
        );
        if let Workload::Download { url } = &exp.workload {
            let hostname = util::hostname_from_url(url);
            stack.push(
                self.add_dns_override(&exp.server, hostname, exp.external_ip())
                    .await?,
            );
        }
        Ok(())
    }

    /// Insert a PREROUTING DNAT rule on the NAT relay, mapping traffic from
    /// `source_ip` to the server's LAN address. Teardown deletes the same rule
    /// by its full specification.
    pub async fn add_dnat_rule(
        &self,
        nat_host: &Host,
        source_ip: &str,
        dest_lan_ip: &str,
    ) -> Result<Box<dyn Guard>, Error> {
        let rule = format!(
            "PREROUTING -i {} --source {} -j DNAT --to-destination {}",
            nat_host.ifname_remote, source_ip, dest_lan_ip
        );
        let setup = format!("sudo iptables -t nat -A {rule}");
        self.executor
            .execute(nat_host, &setup)
            .await?
            .require_success(nat_host, &setup)?;
        log::info!("added DNAT rule {source_ip} -> {dest_lan_ip} on {}", nat_host.ip_wan);
        Ok(Box::new(RemoteCommandGuard::new(
            self.executor.clone(),
            nat_host.clone(),
            format!("DNAT rule for {source_ip}"),
            format!("sudo iptables -t nat -D {rule}"),
        )))
    }

    /// Add a static route on the server towards `dest_ip` via `gateway_ip`.
    /// Teardown deletes that exact route.
    pub async fn add_route(
        &self,
        server: &Host,
        dest_ip: &str,
        gateway_ip: &str,
    ) -> Result<Box<dyn Guard>, Error> {
        let setup = format!("sudo ip route add {dest_ip}/32 via {gateway_ip}");
        self.executor
            .execute(server, &setup)
            .await?
            .require_success(server, &setup)?;
        log::info!("added route to {dest_ip} via {gateway_ip} on {}", server.ip_wan);
        Ok(Box::new(RemoteCommandGuard::new(
            self.executor.clone(),
            server.clone(),
            format!("route to {dest_ip}"),
            format!("sudo ip route del {dest_ip}/32 via {gateway_ip}"),
        )))
    }

    /// Append a host-to-address mapping to the server's /etc/hosts. Teardown
    /// removes exactly the inserted line, not the last line of the file.
    pub async fn add_dns_override(
        &self,
        server: &Host,
        hostname: &str,
        ip_addr: &str,
    ) -> Result<Box<dyn Guard>, Error> {
        let setup = format!("echo '{ip_addr} {hostname}' | sudo tee -a /etc/hosts");
        self.executor
            .execute(server, &setup)
            .await?
            .require_success(server, &setup)?;
        log::info!("added hosts entry {hostname} -> {ip_addr} on {}", server.ip_wan);
        let line_pattern = format!(
            "{}[[:space:]]\\+{}",
            ip_addr.replace('.', "\\."),
            hostname.replace('.', "\\.")
        );
        Ok(Box::new(RemoteCommandGuard::new(
            self.executor.clone(),
            server.clone(),
            format!("hosts entry for {hostname}"),
            format!("sudo sed -i '/^{line_pattern}$/d' /etc/hosts"),
        )))
    }
}
