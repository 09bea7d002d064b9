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
//! EC2 instance lifecycle: idempotent find-or-create per region, readiness
//! polling, post-boot provisioning and safe stop/snapshot on release.
//!
//! The invariant is at most one running instance per region, enforced by
//! discovery-before-create. Concurrent workers must partition work by region.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::{BackoffPolicy, CloudConfig},
    error::Error,
    hosts::Host,
    remote::{run_local_command, Executor},
};

/// Lifecycle states of a managed instance. Transitions are monotonic and
/// nothing leaves `Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceState {
    Absent,
    Creating,
    Running,
    Provisioned,
    Stopping,
    Stopped,
    Imaged,
    Terminated,
}

/// The one live instance record of a region.
#[derive(Clone, Debug)]
pub struct CloudInstanceRecord {
    pub region: String,
    pub instance_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub key_name: String,
    state: InstanceState,
}

impl CloudInstanceRecord {
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Advance the lifecycle. Going backwards or leaving a terminal state is
    /// an invariant violation.
    pub fn transition(&mut self, to: InstanceState) -> Result<(), Error> {
        if self.state == InstanceState::Terminated || to < self.state {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        log::debug!(
            "instance {} in {}: {:?} -> {to:?}",
            self.instance_id,
            self.region,
            self.state
        );
        self.state = to;
        Ok(())
    }
}

/// An instance as reported by the provider.
#[derive(Clone, Debug, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub public_ip: String,
    pub private_ip: String,
}

/// Capability set consumed from the cloud provider. Production code shells
/// out to the `aws` CLI ([`AwsCli`]); tests script a fake.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn list_regions(&self) -> Result<Vec<String>, Error>;
    async fn list_running_instances(&self, region: &str)
        -> Result<Vec<InstanceDescription>, Error>;
    async fn list_available_zones(&self, region: &str) -> Result<Vec<String>, Error>;
    /// Resolve an image by name filter. `owned_only` restricts to images
    /// created by this account (region snapshots).
    async fn find_image(
        &self,
        region: &str,
        name_pattern: &str,
        owned_only: bool,
    ) -> Result<Option<String>, Error>;
    async fn create_instance(
        &self,
        region: &str,
        zone: &str,
        image_id: &str,
        key_name: &str,
    ) -> Result<InstanceDescription, Error>;
    async fn authorize_ssh_ingress(&self, region: &str) -> Result<(), Error>;
    async fn find_key_pair(&self, region: &str, prefix: &str) -> Result<Option<String>, Error>;
    /// Create a key pair and store its material under `~/.ssh/<name>.pem`.
    async fn create_key_pair(&self, region: &str, name: &str) -> Result<String, Error>;
    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<(), Error>;
    async fn instance_state(&self, region: &str, instance_id: &str) -> Result<String, Error>;
    async fn create_image(
        &self,
        region: &str,
        instance_id: &str,
        name: &str,
    ) -> Result<(), Error>;
}

pub struct CloudInstanceLifecycle<A> {
    api: A,
    executor: Arc<dyn Executor>,
    config: CloudConfig,
}

impl<A: Ec2Api> CloudInstanceLifecycle<A> {
    pub fn new(api: A, executor: Arc<dyn Executor>, config: CloudConfig) -> Self {
        Self {
            api,
            executor,
            config,
        }
    }

    /// Address the instance as a host for remote execution.
    pub fn instance_host(&self, record: &CloudInstanceRecord) -> Result<Host, Error> {
        Host::new(
            "eth0",
            "eth0",
            record.private_ip.clone(),
            record.public_ip.clone(),
            "",
            key_pair_path(&record.key_name),
            self.config.instance_username.clone(),
        )
    }

    /// Discovery-first, idempotent per-region acquisition: reuse the single
    /// running instance, or create one from the region image (skipping base
    /// provisioning) or the base image (full provisioning). Kernel modules
    /// are re-applied on every call since module state does not survive a
    /// stop/start cycle.
    pub async fn ensure_instance(&self, region: &str) -> Result<CloudInstanceRecord, Error> {
        let running = self.api.list_running_instances(region).await?;
        if running.len() > 1 {
            return Err(Error::AmbiguousState {
                region: region.to_string(),
                count: running.len(),
            });
        }

        let key_name = self.ensure_key_pair(region).await?;
        let mut record = match running.into_iter().next() {
            Some(instance) => {
                log::info!("reusing instance {} in {region}", instance.instance_id);
                let mut record = record_from(region, instance, &key_name);
                record.transition(InstanceState::Running)?;
                record
            }
            None => self.create_instance(region, &key_name).await?,
        };

        let host = self.instance_host(&record)?;
        self.wait_for_ssh(region, &host).await?;
        self.install_kernel_modules(&host).await?;
        record.transition(InstanceState::Provisioned)?;
        Ok(record)
    }

    async fn create_instance(
        &self,
        region: &str,
        key_name: &str,
    ) -> Result<CloudInstanceRecord, Error> {
        let zone = self.pick_zone(region).await?;
        let (image_id, fresh) = match self.api.find_image(region, region, true).await? {
            Some(image_id) => (image_id, false),
            None => {
                log::warn!("no region image for {region}, creating from base image");
                let image_id = self
                    .api
                    .find_image(region, &self.config.base_image_pattern, false)
                    .await?
                    .ok_or_else(|| Error::MissingImage {
                        region: region.to_string(),
                        pattern: self.config.base_image_pattern.clone(),
                    })?;
                (image_id, true)
            }
        };

        self.api.authorize_ssh_ingress(region).await?;
        log::info!("creating instance in {region} (zone {zone}, image {image_id})");
        let instance = self
            .api
            .create_instance(region, &zone, &image_id, key_name)
            .await?;
        let mut record = record_from(region, instance, key_name);
        record.transition(InstanceState::Creating)?;

        let host = self.instance_host(&record)?;
        self.wait_for_ssh(region, &host).await?;
        record.transition(InstanceState::Running)?;

        if fresh {
            self.provision(region, &host).await?;
        }
        Ok(record)
    }

    async fn ensure_key_pair(&self, region: &str) -> Result<String, Error> {
        if let Some(key_name) = self
            .api
            .find_key_pair(region, &self.config.key_prefix)
            .await?
        {
            return Ok(key_name);
        }
        let name = format!("{}-{region}", self.config.key_prefix);
        log::warn!("creating key pair {name} for region {region}");
        self.api.create_key_pair(region, &name).await
    }

    async fn pick_zone(&self, region: &str) -> Result<String, Error> {
        // some regions have a default zone that cannot host our instance type
        if let Some((_, zone)) = self
            .config
            .zone_overrides
            .iter()
            .find(|(r, _)| r.as_str() == region)
        {
            return Ok(zone.clone());
        }
        self.api
            .list_available_zones(region)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoAvailableZone {
                region: region.to_string(),
            })
    }

    /// Poll SSH readiness with a bounded fixed backoff. Any `Connect` error
    /// means "not ready yet".
    async fn wait_for_ssh(&self, region: &str, host: &Host) -> Result<(), Error> {
        let BackoffPolicy { attempts, delay } = self.config.ssh_backoff;
        for attempt in 1..=attempts {
            match self.executor.check_connection(host).await {
                Ok(()) => return Ok(()),
                Err(Error::Connect { .. }) => {
                    log::info!(
                        "waiting {delay:?} for {} to become reachable (attempt {attempt}/{attempts})",
                        host.ip_wan
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ProvisionTimeout {
            region: region.to_string(),
            attempts,
        })
    }

    /// First-time setup of a base-image instance. Each step is a logged
    /// remote command; a mid-sequence failure aborts without undoing earlier
    /// steps since they are idempotent to re-run.
    async fn provision(&self, region: &str, host: &Host) -> Result<(), Error> {
        log::info!("provisioning fresh instance in {region}");
        let clone_cmd = format!(
            "cd /opt && sudo chown -R {} /opt && git clone {}",
            self.config.instance_username, self.config.repo_url
        );
        self.run_step(host, &clone_cmd).await?;
        self.run_step(host, "cd /opt/cctestbed && ./setup-kernel.sh upgrade_kernel")
            .await?;

        log::info!("waiting {:?} for the instance to reboot", self.config.reboot_settle);
        tokio::time::sleep(self.config.reboot_settle).await;
        self.wait_for_ssh(region, host).await?;

        self.run_step(host, "cd /opt/cctestbed && ./setup-kernel.sh install_iperf3")
            .await?;
        self.run_step(host, "cd /opt/cctestbed/tcp_bbr_measure && make")
            .await?;
        for setting in [
            "net.core.wmem_max = 16777216",
            "net.core.rmem_max = 16777216",
            "net.core.wmem_default = 16777216",
            "net.core.rmem_default = 16777216",
            "net.ipv4.tcp_wmem = 10240 16777216 16777216",
            "net.ipv4.tcp_rmem = 10240 16777216 16777216",
        ] {
            self.run_step(host, &format!("echo {setting} | sudo tee -a /etc/sysctl.conf"))
                .await?;
        }
        self.run_step(host, "sudo sysctl -p").await?;
        Ok(())
    }

    /// Transient kernel-module configuration, re-applied on every reuse since
    /// it does not survive a stop/start cycle.
    pub async fn install_kernel_modules(&self, host: &Host) -> Result<(), Error> {
        for cmd in [
            "cd /opt/cctestbed/tcp_bbr_measure && sudo insmod tcp_probe_ray.ko",
            "for f in /lib/modules/$(uname -r)/kernel/net/ipv4/tcp_*; do \
             sudo modprobe $(basename $f .ko); done",
            "sudo rmmod tcp_probe || true",
            "echo 'net.ipv4.tcp_allowed_congestion_control=cubic reno bic bbr cdg dctcp \
             highspeed htcp hybla illinois lp nv scalable vegas veno westwood yeah' \
             | sudo tee -a /etc/sysctl.conf",
            "sudo sysctl -p",
            "sudo ethtool -K eth0 tx off sg off tso off",
        ] {
            self.run_step(host, cmd).await?;
        }
        Ok(())
    }

    async fn run_step(&self, host: &Host, cmd: &str) -> Result<(), Error> {
        let output = self
            .executor
            .execute(host, cmd)
            .await?
            .require_success(host, cmd)?;
        log::info!("{}", output.stdout.trim());
        Ok(())
    }

    /// Stop the instance, wait for the stopped state and snapshot it to a
    /// region image if none exists yet, so future runs skip provisioning.
    pub async fn release_instance(&self, record: &mut CloudInstanceRecord) -> Result<(), Error> {
        record.transition(InstanceState::Stopping)?;
        log::info!("stopping instance {} in {}", record.instance_id, record.region);
        self.api
            .stop_instance(&record.region, &record.instance_id)
            .await?;

        let BackoffPolicy { attempts, delay } = self.config.stop_backoff;
        let mut stopped = false;
        for _ in 0..attempts {
            let state = self
                .api
                .instance_state(&record.region, &record.instance_id)
                .await?;
            if state == "stopped" {
                stopped = true;
                break;
            }
            tokio::time::sleep(delay).await;
        }
        if !stopped {
            log::warn!(
                "instance {} did not reach stopped state in time",
                record.instance_id
            );
        }
        record.transition(InstanceState::Stopped)?;

        if self
            .api
            .find_image(&record.region, &record.region, true)
            .await?
            .is_none()
        {
            log::info!("creating image for region {}", record.region);
            match self
                .api
                .create_image(&record.region, &record.instance_id, &record.region)
                .await
            {
                Ok(()) => record.transition(InstanceState::Imaged)?,
                Err(e) => log::error!("error while trying to create image: {e}"),
            }
        }
        Ok(())
    }
}

fn record_from(
    region: &str,
    instance: InstanceDescription,
    key_name: &str,
) -> CloudInstanceRecord {
    CloudInstanceRecord {
        region: region.to_string(),
        instance_id: instance.instance_id,
        public_ip: instance.public_ip,
        private_ip: instance.private_ip,
        key_name: key_name.to_string(),
        state: InstanceState::Absent,
    }
}

fn key_pair_path(key_name: &str) -> String {
    format!(
        "{}/.ssh/{key_name}.pem",
        std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
    )
}

/// [`Ec2Api`] implementation shelling out to the `aws` CLI with JSON output.
pub struct AwsCli;

impl AwsCli {
    async fn query(&self, args: &str) -> Result<serde_json::Value, Error> {
        let cmd = format!("aws ec2 {args} --output json");
        let output = run_local_command(&cmd).await?;
        if !output.success() {
            return Err(Error::CommandFailure {
                host: "localhost".to_string(),
                cmd,
                status: output.status,
            });
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }
}

#[async_trait]
impl Ec2Api for AwsCli {
    async fn list_regions(&self) -> Result<Vec<String>, Error> {
        let value = self.query("describe-regions").await?;
        Ok(json_array(&value["Regions"])
            .iter()
            .filter_map(|region| region["RegionName"].as_str())
            .map(str::to_string)
            .collect())
    }

    async fn list_running_instances(
        &self,
        region: &str,
    ) -> Result<Vec<InstanceDescription>, Error> {
        let value = self
            .query(&format!(
                "describe-instances --region {region} \
                 --filters Name=instance-state-name,Values=running"
            ))
            .await?;
        let mut instances = Vec::new();
        for reservation in json_array(&value["Reservations"]) {
            for instance in json_array(&reservation["Instances"]) {
                instances.push(InstanceDescription {
                    instance_id: json_str(&instance, "InstanceId"),
                    public_ip: json_str(&instance, "PublicIpAddress"),
                    private_ip: json_str(&instance, "PrivateIpAddress"),
                });
            }
        }
        Ok(instances)
    }

    async fn list_available_zones(&self, region: &str) -> Result<Vec<String>, Error> {
        let value = self
            .query(&format!(
                "describe-availability-zones --region {region} \
                 --filters Name=state,Values=available"
            ))
            .await?;
        Ok(json_array(&value["AvailabilityZones"])
            .iter()
            .filter_map(|zone| zone["ZoneName"].as_str())
            .map(str::to_string)
            .collect())
    }

    async fn find_image(
        &self,
        region: &str,
        name_pattern: &str,
        owned_only: bool,
    ) -> Result<Option<String>, Error> {
        let owners = if owned_only { " --owners self" } else { "" };
        let value = self
            .query(&format!(
                "describe-images --region {region}{owners} \
                 --filters Name=name,Values='{name_pattern}'"
            ))
            .await?;
        Ok(json_array(&value["Images"])
            .iter()
            .filter_map(|image| image["ImageId"].as_str())
            .map(str::to_string)
            .next())
    }

    async fn create_instance(
        &self,
        region: &str,
        zone: &str,
        image_id: &str,
        key_name: &str,
    ) -> Result<InstanceDescription, Error> {
        let value = self
            .query(&format!(
                "run-instances --region {region} --image-id {image_id} \
                 --instance-type t2.micro --key-name {key_name} \
                 --placement AvailabilityZone={zone} \
                 --associate-public-ip-address --count 1"
            ))
            .await?;
        let instance = json_array(&value["Instances"])
            .into_iter()
            .next()
            .ok_or(Error::InvalidConfig {
                field: "run-instances",
                reason: "response contains no instance".to_string(),
            })?;
        Ok(InstanceDescription {
            instance_id: json_str(&instance, "InstanceId"),
            public_ip: json_str(&instance, "PublicIpAddress"),
            private_ip: json_str(&instance, "PrivateIpAddress"),
        })
    }

    async fn authorize_ssh_ingress(&self, region: &str) -> Result<(), Error> {
        let cmd = format!(
            "aws ec2 authorize-security-group-ingress --region {region} \
             --group-name default --protocol tcp --port 22 --cidr 0.0.0.0/0 --output json"
        );
        let output = run_local_command(&cmd).await?;
        // re-authorizing an existing rule is fine, anything else leaves port
        // 22 closed and must surface here rather than as an SSH timeout later
        if output.success() || is_duplicate_rule(&output.stderr) {
            Ok(())
        } else {
            Err(Error::CommandFailure {
                host: "localhost".to_string(),
                cmd,
                status: output.status,
            })
        }
    }

    async fn find_key_pair(&self, region: &str, prefix: &str) -> Result<Option<String>, Error> {
        let value = self
            .query(&format!("describe-key-pairs --region {region}"))
            .await?;
        Ok(json_array(&value["KeyPairs"])
            .iter()
            .filter_map(|pair| pair["KeyName"].as_str())
            .find(|name| name.starts_with(prefix))
            .map(str::to_string))
    }

    async fn create_key_pair(&self, region: &str, name: &str) -> Result<String, Error> {
        let value = self
            .query(&format!(
                "create-key-pair --region {region} --key-name {name}"
            ))
            .await?;
        let material = json_str(&value, "KeyMaterial");
        let path = key_pair_path(name);
        std::fs::write(&path, material)?;
        let mut perms = std::fs::metadata(&path)?.permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o600);
        std::fs::set_permissions(&path, perms)?;
        Ok(name.to_string())
    }

    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<(), Error> {
        self.query(&format!(
            "stop-instances --region {region} --instance-ids {instance_id}"
        ))
        .await
        .map(|_| ())
    }

    async fn instance_state(&self, region: &str, instance_id: &str) -> Result<String, Error> {
        let value = self
            .query(&format!(
                "describe-instances --region {region} --instance-ids {instance_id}"
            ))
            .await?;
        Ok(json_array(&value["Reservations"])
            .first()
            .map(|reservation| json_array(&reservation["Instances"]))
            .and_then(|instances| instances.first().cloned())
            .map(|instance| json_str(&instance, "State"))
            .unwrap_or_default())
    }

    async fn create_image(
        &self,
        region: &str,
        instance_id: &str,
        name: &str,
    ) -> Result<(), Error> {
        self.query(&format!(
            "create-image --region {region} --instance-id {instance_id} --name {name}"
        ))
        .await
        .map(|_| ())
    }
}

fn is_duplicate_rule(stderr: &str) -> bool {
    stderr.contains("InvalidPermission.Duplicate")
}

fn json_array(value: &serde_json::Value) -> Vec<serde_json::Value> {
    value.as_array().cloned().unwrap_or_default()
}

fn json_str(value: &serde_json::Value, key: &str) -> String {
    match &value[key] {
        serde_json::Value::String(s) => s.clone(),
        // instance state comes nested as {"State": {"Name": ...}}
        nested => nested["Name"].as_str().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::testing::FakeExecutor;

    #[derive(Default)]
    struct FakeEc2 {
        running: Vec<InstanceDescription>,
        region_image: Option<String>,
        base_image: Option<String>,
        zones: Vec<String>,
        key_pair: Option<String>,
        stop_after_polls: usize,
        create_calls: Mutex<usize>,
        stop_calls: Mutex<usize>,
        image_calls: Mutex<usize>,
        polls: Mutex<usize>,
    }

    fn instance(id: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: id.to_string(),
            public_ip: "34.217.3.1".to_string(),
            private_ip: "172.31.0.4".to_string(),
        }
    }

    #[async_trait]
    impl Ec2Api for FakeEc2 {
        async fn list_regions(&self) -> Result<Vec<String>, Error> {
            Ok(vec!["us-west-2".to_string()])
        }

        async fn list_running_instances(
            &self,
            _region: &str,
        ) -> Result<Vec<InstanceDescription>, Error> {
            Ok(self.running.clone())
        }

        async fn list_available_zones(&self, _region: &str) -> Result<Vec<String>, Error> {
            Ok(self.zones.clone())
        }

        async fn find_image(
            &self,
            _region: &str,
            _name_pattern: &str,
            owned_only: bool,
        ) -> Result<Option<String>, Error> {
            Ok(if owned_only {
                self.region_image.clone()
            } else {
                self.base_image.clone()
            })
        }

        async fn create_instance(
            &self,
            _region: &str,
            _zone: &str,
            _image_id: &str,
            _key_name: &str,
        ) -> Result<InstanceDescription, Error> {
            *self.create_calls.lock().unwrap() += 1;
            Ok(instance("i-created"))
        }

        async fn authorize_ssh_ingress(&self, _region: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn find_key_pair(
            &self,
            _region: &str,
            _prefix: &str,
        ) -> Result<Option<String>, Error> {
            Ok(self.key_pair.clone())
        }

        async fn create_key_pair(&self, _region: &str, name: &str) -> Result<String, Error> {
            Ok(name.to_string())
        }

        async fn stop_instance(&self, _region: &str, _instance_id: &str) -> Result<(), Error> {
            *self.stop_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn instance_state(
            &self,
            _region: &str,
            _instance_id: &str,
        ) -> Result<String, Error> {
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            Ok(if *polls > self.stop_after_polls {
                "stopped".to_string()
            } else {
                "stopping".to_string()
            })
        }

        async fn create_image(
            &self,
            _region: &str,
            _instance_id: &str,
            _name: &str,
        ) -> Result<(), Error> {
            *self.image_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn config() -> CloudConfig {
        CloudConfig {
            ssh_backoff: BackoffPolicy::new(3, Duration::from_millis(1)),
            stop_backoff: BackoffPolicy::new(5, Duration::from_millis(1)),
            reboot_settle: Duration::from_millis(1),
            ..CloudConfig::default()
        }
    }

    fn lifecycle(api: FakeEc2) -> (CloudInstanceLifecycle<FakeEc2>, Arc<FakeExecutor>) {
        let executor = Arc::new(FakeExecutor::new());
        (
            CloudInstanceLifecycle::new(api, executor.clone(), config()),
            executor,
        )
    }

    #[tokio::test]
    async fn two_running_instances_is_ambiguous_and_mutates_nothing() {
        let api = FakeEc2 {
            running: vec![instance("i-1"), instance("i-2")],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, executor) = lifecycle(api);
        let result = lifecycle.ensure_instance("us-west-2").await;
        assert!(matches!(result, Err(Error::AmbiguousState { count: 2, .. })));
        assert_eq!(*lifecycle.api.create_calls.lock().unwrap(), 0);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn region_image_skips_provisioning_but_reapplies_modules() {
        let api = FakeEc2 {
            region_image: Some("ami-region".to_string()),
            zones: vec!["us-west-2a".to_string()],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, executor) = lifecycle(api);
        let record = lifecycle.ensure_instance("us-west-2").await.unwrap();
        assert_eq!(record.state(), InstanceState::Provisioned);
        assert_eq!(*lifecycle.api.create_calls.lock().unwrap(), 1);

        let calls = executor.calls();
        assert!(!calls.iter().any(|cmd| cmd.contains("setup-kernel.sh")));
        assert!(calls.iter().any(|cmd| cmd.contains("insmod tcp_probe_ray.ko")));
        assert!(calls.iter().any(|cmd| cmd.contains("ethtool -K eth0")));
    }

    #[tokio::test]
    async fn base_image_runs_full_provisioning() {
        let api = FakeEc2 {
            base_image: Some("ami-base".to_string()),
            zones: vec!["us-west-2a".to_string()],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, executor) = lifecycle(api);
        let record = lifecycle.ensure_instance("us-west-2").await.unwrap();
        assert_eq!(record.state(), InstanceState::Provisioned);

        let calls = executor.calls();
        assert!(calls.iter().any(|cmd| cmd.contains("git clone")));
        assert!(calls.iter().any(|cmd| cmd.contains("upgrade_kernel")));
        assert!(calls.iter().any(|cmd| cmd.contains("install_iperf3")));
    }

    #[tokio::test]
    async fn reuse_waits_for_ssh_readiness() {
        let api = FakeEc2 {
            running: vec![instance("i-1")],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, executor) = lifecycle(api);
        executor.refuse_connections(2);
        let record = lifecycle.ensure_instance("us-west-2").await.unwrap();
        assert_eq!(record.instance_id, "i-1");
        assert_eq!(*lifecycle.api.create_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unreachable_instance_times_out() {
        let api = FakeEc2 {
            running: vec![instance("i-1")],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, executor) = lifecycle(api);
        executor.refuse_connections(100);
        let result = lifecycle.ensure_instance("us-west-2").await;
        assert!(matches!(
            result,
            Err(Error::ProvisionTimeout { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn release_stops_and_snapshots_once() {
        let api = FakeEc2 {
            running: vec![instance("i-1")],
            key_pair: Some("cctestbed-us-west-2".to_string()),
            stop_after_polls: 2,
            ..FakeEc2::default()
        };
        let (lifecycle, _) = lifecycle(api);
        let mut record = lifecycle.ensure_instance("us-west-2").await.unwrap();

        lifecycle.release_instance(&mut record).await.unwrap();
        assert_eq!(record.state(), InstanceState::Imaged);
        assert_eq!(*lifecycle.api.stop_calls.lock().unwrap(), 1);
        assert_eq!(*lifecycle.api.image_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn release_skips_snapshot_when_image_exists() {
        let api = FakeEc2 {
            running: vec![instance("i-1")],
            region_image: Some("ami-region".to_string()),
            key_pair: Some("cctestbed-us-west-2".to_string()),
            ..FakeEc2::default()
        };
        let (lifecycle, _) = lifecycle(api);
        let mut record = lifecycle.ensure_instance("us-west-2").await.unwrap();
        lifecycle.release_instance(&mut record).await.unwrap();
        assert_eq!(record.state(), InstanceState::Stopped);
        assert_eq!(*lifecycle.api.image_calls.lock().unwrap(), 0);
    }

    #[test]
    fn lifecycle_states_are_monotonic() {
        let mut record = record_from("us-west-2", instance("i-1"), "key");
        record.transition(InstanceState::Creating).unwrap();
        record.transition(InstanceState::Running).unwrap();
        assert!(matches!(
            record.transition(InstanceState::Creating),
            Err(Error::InvalidTransition { .. })
        ));
        record.transition(InstanceState::Terminated).unwrap();
        assert!(record.transition(InstanceState::Running).is_err());
        assert!(record.transition(InstanceState::Terminated).is_err());
    }

    #[test]
    fn only_duplicate_ingress_rules_are_tolerated() {
        assert!(is_duplicate_rule(
            "An error occurred (InvalidPermission.Duplicate) when calling the \
             AuthorizeSecurityGroupIngress operation: the specified rule already exists"
        ));
        assert!(!is_duplicate_rule(
            "An error occurred (InvalidGroup.NotFound) when calling the \
             AuthorizeSecurityGroupIngress operation: the security group 'default' does not exist"
        ));
        assert!(!is_duplicate_rule("Unable to locate credentials"));
        assert!(!is_duplicate_rule(""));
    }

    #[test]
    fn zone_override_applies() {
        // exercised through pick_zone's override list in the default config
        let config = CloudConfig::default();
        assert!(config
            .zone_overrides
            .iter()
            .any(|(region, zone)| region == "us-west-1" && zone == "us-west-1c"));
    }
}
