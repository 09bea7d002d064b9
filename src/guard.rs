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
//! Scoped acquisition of transient remote state.
//!
//! Every piece of transient state (a NAT rule, a route, a capture process, the
//! shaping pipeline) is acquired through a component method that performs the
//! setup and returns a [`Guard`] holding the exact inverse. Guards are pushed
//! onto a [`GuardStack`] which releases them in reverse acquisition order.
//! A failure to run an experiment must never be masked; a failure to *clean
//! up* must never abort cleanup of the rest of the stack.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::Error,
    hosts::Host,
    remote::Executor,
};

/// One acquired resource whose teardown is the exact semantic inverse of its
/// setup, applied to the same host.
#[async_trait]
pub trait Guard: Send {
    /// Short description used in log lines.
    fn label(&self) -> String;

    /// Undo the setup. Consumes the guard, so it runs at most once.
    async fn release(self: Box<Self>) -> Result<(), Error>;
}

/// LIFO stack of acquired guards.
///
/// If guards G1, G2, G3 were pushed in order, [`GuardStack::unwind`] releases
/// G3, G2, G1 — irrespective of whether the protected body succeeded or
/// failed.
#[derive(Default)]
pub struct GuardStack {
    guards: Vec<Box<dyn Guard>>,
}

impl GuardStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guard: Box<dyn Guard>) {
        log::debug!("acquired {}", guard.label());
        self.guards.push(guard);
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Release all guards in reverse acquisition order. Teardown failures are
    /// logged and swallowed so that the remaining guards still unwind.
    pub async fn unwind(&mut self) {
        while let Some(guard) = self.guards.pop() {
            let label = guard.label();
            log::debug!("releasing {label}");
            if let Err(e) = guard.release().await {
                log::error!("teardown of {label} failed: {e}");
            }
        }
    }
}

impl Drop for GuardStack {
    fn drop(&mut self) {
        // teardown is async and cannot run here
        if !self.guards.is_empty() {
            log::warn!(
                "dropping {} unreleased guards, call unwind() before dropping the stack",
                self.guards.len()
            );
        }
    }
}

/// Guard around a background process, optionally with a remote stop command
/// issued before the local child is reaped.
pub struct BackgroundProcessGuard {
    label: String,
    handle: Box<dyn crate::remote::BackgroundProcess>,
    remote_stop: Option<(Arc<dyn Executor>, Host, String)>,
}

impl BackgroundProcessGuard {
    pub fn new(
        label: impl Into<String>,
        handle: Box<dyn crate::remote::BackgroundProcess>,
        remote_stop: Option<(Arc<dyn Executor>, Host, String)>,
    ) -> Self {
        Self {
            label: label.into(),
            handle,
            remote_stop,
        }
    }
}

#[async_trait]
impl Guard for BackgroundProcessGuard {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn release(self: Box<Self>) -> Result<(), Error> {
        if let Some((executor, host, cmd)) = self.remote_stop {
            // the process may already have exited, a failed pkill is fine
            if let Err(e) = executor.execute(&host, &cmd).await {
                log::debug!("remote stop for {}: {e}", self.label);
            }
        }
        self.handle.terminate().await
    }
}

/// Guard whose teardown is a single remote command.
pub struct RemoteCommandGuard {
    executor: Arc<dyn Executor>,
    host: Host,
    label: String,
    teardown_cmd: String,
}

impl RemoteCommandGuard {
    pub fn new(
        executor: Arc<dyn Executor>,
        host: Host,
        label: impl Into<String>,
        teardown_cmd: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            host,
            label: label.into(),
            teardown_cmd: teardown_cmd.into(),
        }
    }
}

#[async_trait]
impl Guard for RemoteCommandGuard {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn release(self: Box<Self>) -> Result<(), Error> {
        self.executor
            .execute(&self.host, &self.teardown_cmd)
            .await?
            .require_success(&self.host, &self.teardown_cmd)?;
        Ok(())
    }
}
