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
//! Drives a single experiment through its lifecycle.
//!
//! One control thread runs the state machine sequentially; concurrency only
//! comes from the background processes (captures, probes, compression) that
//! are joined explicitly. Running two experiments concurrently against the
//! same server host is unsupported and must be prevented by the caller.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::process::{Child, Command};

use crate::{
    capture::CaptureAndMonitorManager,
    config::{PipelineConfig, RunnerConfig},
    error::Error,
    guard::{BackgroundProcessGuard, GuardStack},
    hosts::{Experiment, Flow, Workload},
    identity,
    network::NetworkStateManager,
    pipeline::ShapingPipeline,
    remote::Executor,
    util,
};

/// Lifecycle of one experiment run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExperimentState {
    Pending,
    NetworkConfigured,
    Capturing,
    PipelineActive,
    FlowRunning,
    Completed,
    Failed,
    Archiving,
    Done,
}

/// Handle on the fire-and-forget compression job. The caller is responsible
/// for waiting on it; a failed compression is a warning, not a hard failure.
pub struct ArchiveJob {
    child: Child,
    pub archive_path: PathBuf,
}

impl ArchiveJob {
    /// Wait for the compression to finish and return the archive path, or
    /// `None` if compressing failed.
    pub async fn wait(mut self) -> Option<PathBuf> {
        match self.child.wait().await {
            Ok(status) if status.success() => Some(self.archive_path),
            Ok(status) => {
                log::warn!(
                    "compressing {} exited with {status}",
                    self.archive_path.display()
                );
                None
            }
            Err(e) => {
                log::warn!("waiting for compression of {}: {e}", self.archive_path.display());
                None
            }
        }
    }
}

pub struct ExperimentRunner {
    executor: Arc<dyn Executor>,
    network: NetworkStateManager,
    captures: CaptureAndMonitorManager,
    pipeline: ShapingPipeline,
    config: RunnerConfig,
    state: ExperimentState,
}

impl ExperimentRunner {
    pub fn new(
        executor: Arc<dyn Executor>,
        pipeline_config: PipelineConfig,
        config: RunnerConfig,
    ) -> Self {
        Self {
            network: NetworkStateManager::new(executor.clone()),
            captures: CaptureAndMonitorManager::new(executor.clone()),
            pipeline: ShapingPipeline::new(pipeline_config),
            executor,
            config,
            state: ExperimentState::Pending,
        }
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    /// Run one experiment to completion. Returns `Ok(None)` when the
    /// completion marker already exists and `force` is not set, without
    /// touching any remote host. On success the logs are handed to a
    /// background compression job whose handle is returned.
    pub async fn run(&mut self, exp: &Experiment) -> Result<Option<ArchiveJob>, Error> {
        self.state = ExperimentState::Pending;
        if !self.config.force && identity::is_completed(&exp.data_dir, &exp.name) {
            log::warn!("skipping completed experiment: {}", exp.name);
            return Ok(None);
        }
        log::info!("running experiment: {}", exp.name);
        // captures append to their log files, so a leftover directory from a
        // forced or failed run would mix two runs into one archive
        let log_dir = exp.log_dir();
        if log_dir.exists() {
            log::warn!("clearing stale logs in {}", log_dir.display());
            std::fs::remove_dir_all(&log_dir)?;
        }
        std::fs::create_dir_all(&log_dir)?;

        let mut stack = GuardStack::new();
        let result = self.run_guarded(exp, &mut stack).await;
        // guards unwind in reverse acquisition order on success and failure
        stack.unwind().await;

        match result {
            Ok(()) => {
                self.state = ExperimentState::Archiving;
                let job = self.compress_logs(exp)?;
                self.state = ExperimentState::Done;
                log::info!("finished experiment: {}", exp.name);
                Ok(Some(job))
            }
            Err(e) => {
                self.state = ExperimentState::Failed;
                log::error!("experiment {} failed: {e}", exp.name);
                if self.config.retain_logs {
                    log::warn!("retaining partial logs in {}", exp.log_dir().display());
                } else {
                    self.delete_logs(exp);
                }
                Err(e)
            }
        }
    }

    async fn run_guarded(&mut self, exp: &Experiment, stack: &mut GuardStack) -> Result<(), Error> {
        self.network.configure(exp, stack).await?;
        self.state = ExperimentState::NetworkConfigured;

        stack.push(self.captures.start_tcpdump(&exp.server, "server", exp).await?);
        if matches!(exp.workload, Workload::Iperf) {
            stack.push(self.captures.start_tcpdump(&exp.client, "client", exp).await?);
            stack.push(self.captures.start_tcpprobe(&exp.client, exp).await?);
        }
        self.state = ExperimentState::Capturing;

        stack.push(self.pipeline.activate(exp).await?);
        self.state = ExperimentState::PipelineActive;

        if self.config.monitor_rtt {
            let target = match &exp.workload {
                Workload::Iperf => exp.server_nat_ip.as_str(),
                Workload::Download { .. } => exp.external_ip(),
            };
            let log = exp.log_dir().join(format!("{}-ping.log", exp.name));
            stack.push(self.captures.start_rtt_monitor(target, &log)?);
        }

        self.state = ExperimentState::FlowRunning;
        self.run_flows(exp, stack).await?;
        self.state = ExperimentState::Completed;
        Ok(())
    }

    /// Issue the workload commands in flow start-time order, blocking on each
    /// until its exit status. A non-zero exit raises and unwinds everything.
    async fn run_flows(&self, exp: &Experiment, stack: &mut GuardStack) -> Result<(), Error> {
        let t0 = Instant::now();
        for flow in exp.flows_in_start_order() {
            let offset = Duration::from_secs(flow.start_time);
            if t0.elapsed() < offset {
                tokio::time::sleep(offset - t0.elapsed()).await;
            }
            let budget = Duration::from_secs(flow.duration()) + self.config.flow_grace;
            match &exp.workload {
                Workload::Iperf => self.run_iperf_flow(exp, flow, stack, budget).await?,
                Workload::Download { url } => self.run_download(exp, flow, url, budget).await?,
            }
        }
        Ok(())
    }

    async fn run_iperf_flow(
        &self,
        exp: &Experiment,
        flow: &Flow,
        stack: &mut GuardStack,
        budget: Duration,
    ) -> Result<(), Error> {
        let server_cmd = format!("iperf3 -s -p {} --one-off", flow.server_port);
        let server_log = flow.server_log.clone().unwrap_or_else(|| {
            exp.log_dir()
                .join(format!("{}-iperf-server-{}.log", exp.name, flow.server_port))
        });
        stack.push(Box::new(BackgroundProcessGuard::new(
            format!("iperf3 server on port {}", flow.server_port),
            self.executor
                .spawn_background(&exp.server, &server_cmd, &server_log)
                .await?,
            Some((
                self.executor.clone(),
                exp.server.clone(),
                format!("pkill -SIGTERM -f 'iperf3 -s -p {}'", flow.server_port),
            )),
        )));

        // the server needs a moment to bind its port before the client dials
        tokio::time::sleep(self.config.server_settle).await;

        let client_cmd = format!(
            "iperf3 -c {} -p {} --cport {} -t {} -C {} -J",
            exp.server_nat_ip,
            flow.server_port,
            flow.client_port,
            flow.duration(),
            flow.ccalg,
        );
        let start = Instant::now();
        let output = self
            .executor
            .execute_with_timeout(&exp.client, &client_cmd, budget)
            .await?
            .require_success(&exp.client, &client_cmd)?;
        log::info!("flow ran for {:.1}s", start.elapsed().as_secs_f64());

        let client_log = flow.client_log.clone().unwrap_or_else(|| {
            exp.log_dir()
                .join(format!("{}-iperf-client-{}.json", exp.name, flow.client_port))
        });
        std::fs::write(&client_log, output.stdout)?;
        Ok(())
    }

    async fn run_download(
        &self,
        exp: &Experiment,
        flow: &Flow,
        url: &str,
        budget: Duration,
    ) -> Result<(), Error> {
        let cmd = format!("wget --bind-address {} -P /tmp/ {url}", exp.server.ip_lan);
        let start = Instant::now();
        let output = self
            .executor
            .execute_with_timeout(&exp.server, &cmd, budget)
            .await?
            .require_success(&exp.server, &cmd)?;
        log::info!("download ran for {:.1}s", start.elapsed().as_secs_f64());
        let log = exp
            .log_dir()
            .join(format!("{}-wget-{}.log", exp.name, flow.server_port));
        std::fs::write(&log, output.stderr)?;
        Ok(())
    }

    /// Launch compression of all captured artifacts into a single archive
    /// named by the experiment identity. Fire-and-forget: the returned handle
    /// is waited on by the batch driver once all experiments ran.
    fn compress_logs(&self, exp: &Experiment) -> Result<ArchiveJob, Error> {
        let archive_path = exp
            .data_dir
            .join(format!("{}-{}.tar.gz", exp.name, util::timestamp()));
        log::info!("compressing logs into {}", archive_path.display());
        let child = Command::new("tar")
            .arg("-czf")
            .arg(&archive_path)
            .arg("-C")
            .arg(exp.log_dir())
            .arg(".")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(ArchiveJob {
            child,
            archive_path,
        })
    }

    /// Remove partial artifacts of a failed run so they never pollute the
    /// completion-marker namespace.
    fn delete_logs(&self, exp: &Experiment) {
        log::warn!("deleting partial logs in {}", exp.log_dir().display());
        if let Err(e) = std::fs::remove_dir_all(exp.log_dir()) {
            log::warn!("could not delete {}: {e}", exp.log_dir().display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::BackoffPolicy,
        hosts::Host,
        testing::FakeExecutor,
    };

    fn testbed() -> (Host, Host) {
        let server = Host::new(
            "ens13",
            "ens13",
            "192.0.0.4",
            "128.2.208.104",
            "8b:00.0",
            "/key",
            "user",
        )
        .unwrap();
        let client = Host::new(
            "ens13",
            "ens3f0",
            "192.0.0.1",
            "34.217.3.1",
            "05:00.0",
            "/key",
            "user",
        )
        .unwrap();
        (server, client)
    }

    fn experiment(name: &str, workload: Workload, data_dir: &std::path::Path) -> Experiment {
        let (server, client) = testbed();
        Experiment::new(
            name,
            10,
            64,
            vec![Flow::new("cubic", 0, 60, 85, 5201, 5555).unwrap()],
            server,
            client,
            "128.2.208.128",
            workload,
            data_dir,
        )
        .unwrap()
    }

    fn runner(executor: Arc<FakeExecutor>, force: bool) -> ExperimentRunner {
        let pipeline = PipelineConfig {
            start_cmd: "true".to_string(),
            status_cmd: "true".to_string(),
            stop_cmd: "true".to_string(),
            ready: BackoffPolicy::new(1, Duration::from_millis(1)),
        };
        let config = RunnerConfig {
            force,
            retain_logs: false,
            flow_grace: Duration::from_secs(5),
            server_settle: Duration::from_millis(1),
            monitor_rtt: false,
        };
        ExperimentRunner::new(executor, pipeline, config)
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cctestbed-runner-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn successful_run_archives_and_then_short_circuits() {
        let dir = temp_dir("ok");
        let exp = experiment("cubic-10bw-85rtt-64q-local", Workload::Iperf, &dir);

        let executor = Arc::new(FakeExecutor::new());
        let mut runner = runner(executor.clone(), false);
        let job = runner.run(&exp).await.unwrap().expect("archive job");
        assert_eq!(runner.state(), ExperimentState::Done);
        assert!(executor.calls().iter().any(|cmd| cmd.contains("iperf3 -c")));

        let archive = job.wait().await.expect("compression should succeed");
        assert!(archive.exists());
        assert!(identity::is_completed(&dir, &exp.name));

        // a second run performs zero remote calls
        let calls_before = executor.calls().len();
        let spawned_before = executor.spawned().len();
        let mut runner2 = runner_with(executor.clone());
        assert!(runner2.run(&exp).await.unwrap().is_none());
        assert_eq!(executor.calls().len(), calls_before);
        assert_eq!(executor.spawned().len(), spawned_before);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn runner_with(executor: Arc<FakeExecutor>) -> ExperimentRunner {
        runner(executor, false)
    }

    #[tokio::test]
    async fn forced_run_reexecutes() {
        let dir = temp_dir("force");
        let exp = experiment("reno-10bw-85rtt-64q-local", Workload::Iperf, &dir);
        std::fs::write(
            dir.join(format!("{}-2025-01-01_00-00-00.tar.gz", exp.name)),
            b"",
        )
        .unwrap();
        // leftovers from the previous run must not end up in the new archive
        let stale = exp.log_dir().join("leftover-tcpdump-server.pcap");
        std::fs::create_dir_all(exp.log_dir()).unwrap();
        std::fs::write(&stale, b"old capture").unwrap();

        let executor = Arc::new(FakeExecutor::new());
        let mut runner = runner(executor.clone(), true);
        runner.run(&exp).await.unwrap().expect("archive job");
        assert!(executor.calls().iter().any(|cmd| cmd.contains("iperf3 -c")));
        assert!(!stale.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn client_connects_only_after_server_settle() {
        let dir = temp_dir("settle");
        let exp = experiment("bbr-10bw-85rtt-64q-local", Workload::Iperf, &dir);

        let executor = Arc::new(FakeExecutor::new());
        let mut runner = runner(executor.clone(), false);
        runner.config.server_settle = Duration::from_millis(50);

        let start = Instant::now();
        runner.run(&exp).await.unwrap().expect("archive job");
        assert!(start.elapsed() >= Duration::from_millis(50));
        // the server was already running when the client dialed
        assert!(executor.spawned().iter().any(|cmd| cmd.contains("iperf3 -s")));
        assert!(executor.calls().iter().any(|cmd| cmd.contains("iperf3 -c")));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn failed_workload_unwinds_and_deletes_partial_logs() {
        let dir = temp_dir("fail");
        let exp = experiment(
            "cubic-10bw-85rtt-64q-web",
            Workload::Download {
                url: "http://example.com/file.bin".to_string(),
            },
            &dir,
        );

        let executor = Arc::new(FakeExecutor::new());
        executor.fail_on("wget", 1);
        let mut runner = runner(executor.clone(), false);
        let result = runner.run(&exp).await;
        assert!(matches!(result, Err(Error::CommandFailure { status: 1, .. })));
        assert_eq!(runner.state(), ExperimentState::Failed);

        // no archive, no completion marker, partial logs removed
        assert!(!identity::is_completed(&dir, &exp.name));
        assert!(!exp.log_dir().exists());

        // network teardown ran exactly once each, in order DNS -> route -> DNAT
        let calls = executor.calls();
        let dns = calls.iter().position(|cmd| cmd.contains("sed -i")).unwrap();
        let route = calls
            .iter()
            .position(|cmd| cmd.contains("ip route del"))
            .unwrap();
        let dnat = calls
            .iter()
            .position(|cmd| cmd.contains("iptables -t nat -D"))
            .unwrap();
        assert!(dns < route && route < dnat);
        assert_eq!(calls.iter().filter(|cmd| cmd.contains("sed -i")).count(), 1);
        assert_eq!(
            calls.iter().filter(|cmd| cmd.contains("ip route del")).count(),
            1
        );
        assert_eq!(
            calls
                .iter()
                .filter(|cmd| cmd.contains("iptables -t nat -D"))
                .count(),
            1
        );
        // the capture process was terminated as well
        assert_eq!(executor.terminated().len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
