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
//! Orchestrates congestion-control experiments on a controlled testbed:
//! configures transient network state on the machines, starts packet captures
//! and kernel probes, activates the traffic-shaping pipeline, drives the
//! workload flows and archives the results. Remote machines are reached over
//! SSH; measurement clients can be leased on EC2, one per region.

pub mod capture;
pub mod cloud;
pub mod config;
pub mod error;
pub mod guard;
pub mod hosts;
pub mod identity;
pub mod network;
pub mod pipeline;
pub mod remote;
pub mod runner;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    pub use crate::{
        capture::CaptureAndMonitorManager,
        cloud::{AwsCli, CloudInstanceLifecycle, Ec2Api, InstanceState},
        config::{CloudConfig, PipelineConfig, RunnerConfig, TestbedConfig},
        error::Error,
        guard::{Guard, GuardStack},
        hosts::{Experiment, Flow, Host, Workload},
        identity::ExperimentParams,
        network::NetworkStateManager,
        pipeline::ShapingPipeline,
        remote::{Executor, SshExecutor},
        runner::{ArchiveJob, ExperimentRunner},
    };
}
