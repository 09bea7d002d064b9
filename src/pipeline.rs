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
//! Activation of the external traffic-shaping pipeline.
//!
//! The pipeline is opaque to the orchestrator: it is started with the
//! experiment's bandwidth and queue-size parameters, polled for readiness,
//! and deactivated on guard release. It runs on the testbed machine itself,
//! so all control commands are local.

use async_trait::async_trait;

use crate::{
    config::PipelineConfig,
    error::Error,
    guard::Guard,
    hosts::Experiment,
    remote::run_local_command,
};

pub struct ShapingPipeline {
    config: PipelineConfig,
}

impl ShapingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn substitute(&self, template: &str, exp: &Experiment) -> String {
        template
            .replace("{btlbw}", &exp.btlbw.to_string())
            .replace("{queue_size}", &exp.queue_size.to_string())
    }

    /// Start the pipeline with `exp`'s parameters and poll until it reports
    /// readiness. On success the returned guard deactivates it on release; on
    /// a failed readiness poll the pipeline is deactivated immediately.
    pub async fn activate(&self, exp: &Experiment) -> Result<Box<dyn Guard>, Error> {
        let start_cmd = self.substitute(&self.config.start_cmd, exp);
        let output = run_local_command(&start_cmd).await?;
        if !output.success() {
            log::debug!("pipeline start stderr: {}", output.stderr.trim());
            return Err(Error::PipelineNotReady { attempts: 0 });
        }

        for attempt in 1..=self.config.ready.attempts {
            let status = run_local_command(&self.config.status_cmd).await?;
            if status.success() {
                log::info!(
                    "shaping pipeline active with btlbw={}Mbps queue={} packets",
                    exp.btlbw,
                    exp.queue_size
                );
                log::debug!("pipeline status:\n{}", status.stdout.trim());
                return Ok(Box::new(PipelineGuard {
                    stop_cmd: self.config.stop_cmd.clone(),
                }));
            }
            log::debug!(
                "pipeline not ready yet (attempt {attempt}/{})",
                self.config.ready.attempts
            );
            tokio::time::sleep(self.config.ready.delay).await;
        }

        // best-effort deactivation of the half-started pipeline
        if let Err(e) = run_local_command(&self.config.stop_cmd).await {
            log::error!("deactivating unready pipeline failed: {e}");
        }
        Err(Error::PipelineNotReady {
            attempts: self.config.ready.attempts,
        })
    }
}

struct PipelineGuard {
    stop_cmd: String,
}

#[async_trait]
impl Guard for PipelineGuard {
    fn label(&self) -> String {
        "shaping pipeline".to_string()
    }

    async fn release(self: Box<Self>) -> Result<(), Error> {
        let output = run_local_command(&self.stop_cmd).await?;
        if !output.success() {
            return Err(Error::CommandFailure {
                host: "localhost".to_string(),
                cmd: self.stop_cmd,
                status: output.status,
            });
        }
        Ok(())
    }
}
