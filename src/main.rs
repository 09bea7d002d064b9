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

use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use cctestbed::{
    capture::measure_rtt,
    cloud::{AwsCli, CloudInstanceLifecycle},
    config::{
        default_conditions, load_conditions, CloudConfig, NetworkCondition, PipelineConfig,
        RunnerConfig, TestbedConfig, DEFAULT_CCALGS,
    },
    hosts::{Experiment, Flow, Host, Workload},
    identity::ExperimentParams,
    remote::{Executor, SshExecutor},
    runner::{ArchiveJob, ExperimentRunner},
    util,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Testbed description (server, client and NAT relay) as JSON.
    #[arg(short, long, default_value = "testbed.json")]
    testbed: PathBuf,
    /// Directory under which logs and result archives accumulate.
    #[arg(short, long, default_value = "./data/")]
    data_root: PathBuf,
    /// Congestion-control algorithms to exercise. Defaults to the full set.
    #[arg(short, long)]
    ccalgs: Vec<String>,
    /// A single network condition as `btlbw,rtt,queue_size`. Can be applied
    /// multiple times; overrides the conditions file.
    #[arg(short = 'n', long = "network", value_parser = parse_condition)]
    networks: Vec<NetworkCondition>,
    /// Headerless CSV of `btlbw,rtt,queue_size` conditions.
    #[arg(long)]
    conditions: Option<PathBuf>,
    /// EC2 regions to lease measurement clients in. Without regions the
    /// testbed's own client machine is used.
    #[arg(short, long)]
    regions: Vec<String>,
    /// Regions to leave out even if listed. Can be applied multiple times.
    #[arg(long)]
    skip_regions: Vec<String>,
    /// Drive a website download from this URL instead of iperf3 flows.
    #[arg(short = 'w', long)]
    download_url: Option<String>,
    /// Flow duration in seconds.
    #[arg(long, default_value_t = 60)]
    duration: u64,
    /// Re-run experiments whose completion marker already exists.
    #[arg(short, long)]
    force: bool,
    /// Keep partial logs of failed experiments.
    #[arg(long)]
    retain_logs: bool,
}

fn parse_condition(s: &str) -> Result<NetworkCondition, String> {
    let parts: Vec<u64> = s
        .split(',')
        .map(|part| part.trim().parse().map_err(|e| format!("{e}")))
        .collect::<Result<_, _>>()?;
    match parts[..] {
        [btlbw, rtt, queue_size] => Ok(NetworkCondition {
            btlbw,
            rtt,
            queue_size,
        }),
        _ => Err("expected btlbw,rtt,queue_size".to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    util::init_logging();

    let args = Args::parse();
    let testbed = TestbedConfig::load(&args.testbed)?;
    std::fs::create_dir_all(&args.data_root)?;

    let conditions = if !args.networks.is_empty() {
        args.networks.clone()
    } else if let Some(path) = &args.conditions {
        load_conditions(path)?
    } else {
        default_conditions()
    };
    let ccalgs: Vec<String> = if args.ccalgs.is_empty() {
        DEFAULT_CCALGS.iter().map(|s| s.to_string()).collect()
    } else {
        args.ccalgs.clone()
    };
    log::info!(
        "{} conditions x {} algorithms over {}",
        conditions.len(),
        ccalgs.len(),
        if args.regions.is_empty() {
            "the local client".to_string()
        } else {
            format!("{} regions", args.regions.len())
        }
    );

    let executor: Arc<dyn Executor> = Arc::new(SshExecutor::new());
    let mut archives = Vec::new();
    if args.regions.is_empty() {
        run_batch(
            &args,
            &testbed,
            executor.clone(),
            testbed.client.clone(),
            "local",
            &conditions,
            &ccalgs,
            0,
            &mut archives,
        )
        .await;
    } else {
        run_cloud_batches(&args, &testbed, executor.clone(), &conditions, &ccalgs, &mut archives)
            .await;
    }

    wait_for_archives(archives).await;
    Ok(())
}

async fn wait_for_archives(jobs: Vec<ArchiveJob>) {
    if jobs.is_empty() {
        return;
    }
    log::info!("waiting for {} compression jobs", jobs.len());
    for job in jobs {
        if let Some(path) = job.wait().await {
            log::info!("archived {}", path.display());
        }
    }
}

/// Run the full condition x algorithm matrix against one client machine.
/// Experiment failures are isolated: they are logged and the batch moves on.
#[allow(clippy::too_many_arguments)]
async fn run_batch(
    args: &Args,
    testbed: &TestbedConfig,
    executor: Arc<dyn Executor>,
    client: Host,
    site: &str,
    conditions: &[NetworkCondition],
    ccalgs: &[String],
    base_rtt: u64,
    archives: &mut Vec<ArchiveJob>,
) {
    for condition in conditions {
        if base_rtt >= condition.rtt {
            log::warn!(
                "skipping {}ms condition at {site}: path RTT is already {base_rtt}ms",
                condition.rtt
            );
            continue;
        }
        for ccalg in ccalgs {
            let exp = match build_experiment(args, testbed, &client, site, condition, ccalg, base_rtt)
            {
                Ok(exp) => exp,
                Err(e) => {
                    log::error!("cannot build experiment for {ccalg} at {site}: {e}");
                    continue;
                }
            };
            let mut runner = ExperimentRunner::new(
                executor.clone(),
                PipelineConfig::default(),
                RunnerConfig {
                    force: args.force,
                    retain_logs: args.retain_logs,
                    ..RunnerConfig::default()
                },
            );
            match runner.run(&exp).await {
                Ok(Some(job)) => archives.push(job),
                Ok(None) => {}
                Err(e) => log::error!("experiment {} failed: {e}", exp.name),
            }
        }
    }
}

/// Lease one client instance per region and run the matrix against each.
/// A region whose instance cannot be acquired is skipped entirely.
async fn run_cloud_batches(
    args: &Args,
    testbed: &TestbedConfig,
    executor: Arc<dyn Executor>,
    conditions: &[NetworkCondition],
    ccalgs: &[String],
    archives: &mut Vec<ArchiveJob>,
) {
    let lifecycle = CloudInstanceLifecycle::new(AwsCli, executor.clone(), CloudConfig::default());
    for region in &args.regions {
        if args.skip_regions.contains(region) {
            log::info!("skipping region {region} as requested");
            continue;
        }
        let mut record = match lifecycle.ensure_instance(region).await {
            Ok(record) => record,
            Err(e) => {
                log::error!("skipping region {region}: {e}");
                continue;
            }
        };
        let client = match lifecycle.instance_host(&record) {
            Ok(client) => client,
            Err(e) => {
                log::error!("skipping region {region}: {e}");
                continue;
            }
        };
        // the emulated RTT comes on top of the real path RTT to the instance
        let base_rtt = match measure_rtt(&client.ip_wan).await {
            Ok(rtt) => rtt.round() as u64,
            Err(e) => {
                log::error!("skipping region {region}: {e}");
                continue;
            }
        };
        log::info!("path RTT to {region} is {base_rtt}ms");

        run_batch(
            args,
            testbed,
            executor.clone(),
            client,
            region,
            conditions,
            ccalgs,
            base_rtt,
            archives,
        )
        .await;

        if let Err(e) = lifecycle.release_instance(&mut record).await {
            log::error!("releasing instance in {region}: {e}");
        }
        // drain this region's compression jobs before moving on
        wait_for_archives(std::mem::take(archives)).await;
    }
}

fn build_experiment(
    args: &Args,
    testbed: &TestbedConfig,
    client: &Host,
    site: &str,
    condition: &NetworkCondition,
    ccalg: &str,
    base_rtt: u64,
) -> Result<Experiment, cctestbed::error::Error> {
    let params = ExperimentParams::new(
        ccalg,
        condition.btlbw,
        condition.rtt,
        condition.queue_size,
        site,
    );
    let flow = Flow::new(
        ccalg,
        0,
        args.duration,
        condition.rtt - base_rtt,
        5201,
        5555,
    )?;
    let workload = match &args.download_url {
        Some(url) => Workload::Download { url: url.clone() },
        None => Workload::Iperf,
    };
    Experiment::new(
        params.name(),
        condition.btlbw,
        condition.queue_size,
        vec![flow],
        testbed.server.clone(),
        client.clone(),
        testbed.server_nat_ip.clone(),
        workload,
        args.data_root.clone(),
    )
}
