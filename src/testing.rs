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
//! Scriptable [`Executor`] used by the unit tests.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    error::Error,
    hosts::Host,
    remote::{BackgroundProcess, CmdOutput, Executor},
};

/// Records every command instead of running it. Commands succeed with empty
/// output unless scripted otherwise via [`FakeExecutor::fail_on`] or
/// [`FakeExecutor::refuse_connections`].
#[derive(Default)]
pub struct FakeExecutor {
    calls: Arc<Mutex<Vec<String>>>,
    spawned: Arc<Mutex<Vec<String>>>,
    terminated: Arc<Mutex<Vec<String>>>,
    failures: Mutex<Vec<(String, i32)>>,
    connection_refusals: Mutex<usize>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command containing `fragment` exit with `status`.
    pub fn fail_on(&self, fragment: &str, status: i32) {
        self.failures
            .lock()
            .unwrap()
            .push((fragment.to_string(), status));
    }

    /// Refuse the next `count` commands with [`Error::Connect`], simulating a
    /// host that is still booting.
    pub fn refuse_connections(&self, count: usize) {
        *self.connection_refusals.lock().unwrap() = count;
    }

    /// Commands executed to completion, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands left running in the background, in spawn order.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    /// Background commands whose handles were terminated.
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, host: &Host, cmd: &str) -> Result<CmdOutput, Error> {
        {
            let mut refusals = self.connection_refusals.lock().unwrap();
            if *refusals > 0 {
                *refusals -= 1;
                return Err(Error::Connect {
                    host: host.ip_wan.clone(),
                    reason: "Connection refused".to_string(),
                });
            }
        }
        self.calls.lock().unwrap().push(cmd.to_string());
        let status = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| cmd.contains(fragment))
            .map(|&(_, status)| status)
            .unwrap_or(0);
        Ok(CmdOutput {
            status,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn spawn_background(
        &self,
        _host: &Host,
        cmd: &str,
        _log: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, Error> {
        self.spawned.lock().unwrap().push(cmd.to_string());
        Ok(Box::new(FakeBackgroundProcess {
            cmd: cmd.to_string(),
            terminated: self.terminated.clone(),
        }))
    }
}

struct FakeBackgroundProcess {
    cmd: String,
    terminated: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BackgroundProcess for FakeBackgroundProcess {
    async fn terminate(self: Box<Self>) -> Result<(), Error> {
        self.terminated.lock().unwrap().push(self.cmd);
        Ok(())
    }
}
