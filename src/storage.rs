// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage backend capability, scoped to the host it runs on.
//!
//! A VDI on each host walks Detached → Attached → Activated → Attached →
//! Detached. On SRs without the activate capability the activate and
//! deactivate steps are no-ops inside the backend; callers do not guard
//! for it. Likewise detaching a VDI this host never attached is a no-op,
//! which keeps failure-path cleanup unconditional.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{AccessMode, VdiRef};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageOp {
    Attach,
    Detach,
    Activate,
    Deactivate,
    Query,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageOp::Attach => "attach",
            StorageOp::Detach => "detach",
            StorageOp::Activate => "activate",
            StorageOp::Deactivate => "deactivate",
            StorageOp::Query => "query",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("storage {op} failed for VDI {vdi}: {reason}")]
pub struct StorageError {
    pub op: StorageOp,
    pub vdi: VdiRef,
    pub reason: String,
}

impl StorageError {
    pub fn new(op: StorageOp, vdi: VdiRef, reason: impl ToString) -> Self {
        StorageError { op, vdi, reason: reason.to_string() }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn attach(
        &self,
        vdi: &VdiRef,
        mode: AccessMode,
    ) -> Result<(), StorageError>;

    async fn detach(&self, vdi: &VdiRef) -> Result<(), StorageError>;

    async fn activate(&self, vdi: &VdiRef) -> Result<(), StorageError>;

    async fn deactivate(&self, vdi: &VdiRef) -> Result<(), StorageError>;

    /// Whether the VDI's SR requires an explicit activation step between
    /// attach and use.
    async fn sr_has_activate_capability(
        &self,
        vdi: &VdiRef,
    ) -> Result<bool, StorageError>;
}
