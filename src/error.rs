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
//! Errors raised while orchestrating experiments.

use std::time::Duration;

use crate::cloud::InstanceState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The SSH transport to a host could not be established. Polling callers
    /// treat this as "not ready yet".
    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    /// A remote or local command ran and exited non-zero.
    #[error("`{cmd}` on {host} exited with status {status}")]
    CommandFailure {
        host: String,
        cmd: String,
        status: i32,
    },

    /// A command exceeded its time budget and was abandoned.
    #[error("`{cmd}` on {host} did not finish within {budget:?}")]
    Timeout {
        host: String,
        cmd: String,
        budget: Duration,
    },

    /// An instance never became reachable within the polling budget.
    #[error("instance in {region} not reachable after {attempts} attempts")]
    ProvisionTimeout { region: String, attempts: usize },

    /// More than one running instance was found where at most one may exist.
    #[error("{count} running instances in {region}, expected at most one")]
    AmbiguousState { region: String, count: usize },

    /// An instance lifecycle transition would go backwards or leave a
    /// terminal state.
    #[error("invalid instance transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("no available zone in {region}")]
    NoAvailableZone { region: String },

    #[error("no image matching `{pattern}` in {region}")]
    MissingImage { region: String, pattern: String },

    /// The shaping pipeline never reported readiness.
    #[error("shaping pipeline not ready after {attempts} status polls")]
    PipelineNotReady { attempts: usize },

    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
