// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task, progress and telemetry sinks.

use async_trait::async_trait;

use crate::db::{HostRef, SessionId, TaskId, VmRef};
use crate::ClusterError;

/// Task states the engine reports. Every migration records at least one
/// terminal state (success, cancelled or failure).
#[derive(Clone, Debug, PartialEq)]
pub enum TaskStatus {
    Pending,
    Success,
    Cancelled,
    Failure(ClusterError),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Reports migration progress in [0, 1] for the task.
    async fn progress(&self, task: &TaskId, fraction: f64);

    async fn task_status(&self, task: &TaskId, status: TaskStatus);

    /// Whether the cluster task has been cancelled by its owner. Polled
    /// at the admission preflight and alongside the external abort flag;
    /// a cancelled task surfaces as [`crate::ClusterError::TaskCancelled`].
    async fn task_cancelled(&self, task: &TaskId) -> bool;

    /// Pushes the VM's RRD telemetry archive to the destination host.
    async fn push_rrd(
        &self,
        session: &SessionId,
        vm: &VmRef,
        destination: &HostRef,
    ) -> Result<(), ClusterError>;

    /// Runs the pre-migrate hook for the VM.
    async fn pre_migrate_hook(&self, vm: &VmRef) -> Result<(), ClusterError>;

    /// Fetches the structured error the destination recorded against the
    /// task, if any.
    async fn remote_task_error(
        &self,
        session: &SessionId,
        task: &TaskId,
    ) -> Option<ClusterError>;
}
