// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intra-cluster live migration of running virtual machines.
//!
//! The engine is split into a source-side transmitter ([`source`]) and a
//! destination-side receiver ([`destination`]) which rendezvous at four
//! barriers over a cleartext byte stream (framed by [`codec`]). The
//! [`coordinator`] admits a migration, brings up the transport and reports
//! the outcome to the task system; [`admission`] is its destination-side
//! counterpart. Everything the engine touches in the outside world — the
//! cluster database, the hypervisor control layer, the storage backend, the
//! task/event system and the abort/suspend-ack liaison — is an injected
//! capability carried in a [`MigrateContext`].
//!
//! Failure semantics revolve around the barrier hand-off: at any exit,
//! exactly one side owns each cleanable artifact. The per-side ledgers in
//! [`ledger`] record what remains to be undone as the protocol advances.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slog::Logger;
use thiserror::Error;

pub mod admission;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod destination;
pub mod events;
pub mod failure_injection;
pub mod hypervisor;
pub mod ledger;
pub mod liaison;
pub mod sim;
pub mod source;
pub mod storage;

use db::{ClusterDb, TaskId};
use events::EventSink;
use hypervisor::{Hypervisor, HypervisorError};
use liaison::MigrationLiaison;
use storage::{StorageBackend, StorageError};

/// Which side of the protocol a participant plays.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Destination,
}

/// Structured errors surfaced to callers of the engine. These carry the
/// code and parameters the cluster task object records against a failed
/// migration.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("migration of {vm} from {source_host} to {destination} failed: {message}")]
    VmMigrateFailed {
        vm: String,
        source_host: String,
        destination: String,
        message: String,
    },

    /// The destination host is administratively disabled.
    #[error("cannot migrate {0}: destination host is disabled")]
    HostDisabled(String),

    /// The destination host could not be reached.
    #[error("host {0} is offline")]
    HostOffline(String),

    /// A conflicting operation holds the named object.
    #[error("another operation is in progress on {class} {object}")]
    OtherOperationInProgress { class: String, object: String },

    /// The cluster task driving this migration was cancelled.
    #[error("task was cancelled")]
    TaskCancelled,

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Errors raised while driving the migration protocol on either side.
///
/// Cleanup paths log and drop their own failures; the first error of the
/// protocol body is always the one carried out of the engine.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MigrateError {
    /// The peer failed and said why over the handshake channel.
    #[error("{0:?} migration instance reported: {1}")]
    Remote(MigrateRole, String),

    /// The transport failed mid-protocol (short read/write, closed peer).
    #[error("migration stream failed: {0}")]
    RemoteFailed(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Already-classified cluster errors pass through verbatim.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The guest crashed instead of suspending; cleanup is left to the
    /// event thread and the VM's `actions_after_crash` policy.
    #[error("Domain crashed while suspending")]
    DomainCrashed,

    #[error("migration aborted by external request")]
    Aborted,

    #[error("guest did not acknowledge suspend within {0} seconds")]
    SuspendAckTimeout(u64),

    #[error("migration failure test at point {0}")]
    FailureTest(u8),
}

impl From<codec::ProtocolError> for MigrateError {
    fn from(e: codec::ProtocolError) -> Self {
        MigrateError::RemoteFailed(e.to_string())
    }
}

/// Capability handles every core entry point operates through. There are
/// no process-wide singletons; a context is cheap to clone and a new one
/// is minted per admitted request on the destination.
#[derive(Clone)]
pub struct MigrateContext {
    pub db: Arc<dyn ClusterDb>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub storage: Arc<dyn StorageBackend>,
    pub events: Arc<dyn EventSink>,
    pub liaison: Arc<dyn MigrationLiaison>,
    /// The cluster task this migration runs under.
    pub task: TaskId,
    pub log: Logger,
}
