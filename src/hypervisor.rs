// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor control capability: domain lifecycle, the memory-image
//! save/restore pair, device plumbing and memory accounting.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::ByteStream;
use crate::db::{BootRecord, VbdRef, VifRef, VmRef};
use crate::MigrateError;

/// Hypervisor-local identity of a running domain.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ShutdownReason {
    Suspend,
    Reboot,
    PowerOff,
    Halt,
    Crashed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownReason::Suspend => "suspend",
            ShutdownReason::Reboot => "reboot",
            ShutdownReason::PowerOff => "poweroff",
            ShutdownReason::Halt => "halt",
            ShutdownReason::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum HypervisorError {
    /// The guest shut down, but not because it acknowledged a suspend.
    #[error(
        "domain shut down for wrong reason: expected {expected}, \
         observed {observed}"
    )]
    ShutdownWrongReason {
        expected: ShutdownReason,
        observed: ShutdownReason,
    },

    #[error("hypervisor {op} failed for domain {domid}: {reason}")]
    Operation {
        op: &'static str,
        domid: DomainId,
        reason: String,
    },
}

impl HypervisorError {
    pub fn op(op: &'static str, domid: DomainId, reason: impl ToString) -> Self {
        HypervisorError::Operation { op, domid, reason: reason.to_string() }
    }
}

/// A PCI passthrough device as the hypervisor names it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PciDevice(pub String);

/// What to tear down along with a local domain.
#[derive(Copy, Clone, Debug)]
pub struct DestroyOpts {
    /// Keep the xenstore tree: the same host is about to adopt the guest.
    pub preserve_xenstore: bool,
    pub detach_devices: bool,
    pub deactivate_devices: bool,
}

/// Callbacks the save routine drives from inside [`Hypervisor::suspend`].
///
/// `progress` reports the save fraction in [0, 1]. `before_final_pause`
/// runs immediately before the guest is paused for final state capture; a
/// failure from either aborts the save.
#[async_trait]
pub trait SuspendHooks: Send {
    async fn progress(&mut self, fraction: f64) -> Result<(), MigrateError>;

    async fn before_final_pause(&mut self) -> Result<(), MigrateError>;
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn is_hvm(&self, domid: DomainId) -> Result<bool, HypervisorError>;

    /// The derived frontend device number for a VBD in a domain.
    async fn vbd_device(
        &self,
        domid: DomainId,
        vbd: &VbdRef,
    ) -> Result<u32, HypervisorError>;

    async fn vbd_paused(
        &self,
        domid: DomainId,
        vbd: &VbdRef,
    ) -> Result<bool, HypervisorError>;

    /// Writes the guest memory image to `stream` and shuts the guest down
    /// with reason Suspend, driving `hooks` along the way. Hook errors
    /// propagate unchanged; a guest that shuts down for any other reason
    /// surfaces as [`HypervisorError::ShutdownWrongReason`].
    async fn suspend(
        &self,
        domid: DomainId,
        hvm: bool,
        live: bool,
        stream: &mut (dyn ByteStream + '_),
        hooks: &mut (dyn SuspendHooks + '_),
    ) -> Result<(), MigrateError>;

    async fn shutdown_domain(
        &self,
        domid: DomainId,
        reason: ShutdownReason,
    ) -> Result<(), HypervisorError>;

    /// Flushes outstanding disk blocks by hard-shutting-down the given
    /// devices, watching any extra xenstore debug paths while doing so.
    async fn hard_shutdown_vbds(
        &self,
        domid: DomainId,
        devices: &[u32],
        extra_debug_paths: &[String],
    ) -> Result<(), HypervisorError>;

    /// Creates a paused proto-domain from the boot-record template.
    async fn create_domain(
        &self,
        vm: &VmRef,
        boot: &BootRecord,
    ) -> Result<DomainId, HypervisorError>;

    async fn reserve_memory(
        &self,
        domid: DomainId,
        kib: u64,
    ) -> Result<(), HypervisorError>;

    async fn restore_devices(
        &self,
        vm: &VmRef,
        domid: DomainId,
        vbds: &[VbdRef],
        vifs: &[VifRef],
    ) -> Result<(), HypervisorError>;

    /// Consumes the memory image from `stream` into the paused domain.
    async fn restore(
        &self,
        domid: DomainId,
        stream: &mut (dyn ByteStream + '_),
    ) -> Result<(), HypervisorError>;

    async fn unpause(&self, domid: DomainId) -> Result<(), HypervisorError>;

    async fn destroy_domain(
        &self,
        domid: DomainId,
        opts: DestroyOpts,
    ) -> Result<(), HypervisorError>;

    async fn pci_list(
        &self,
        domid: DomainId,
    ) -> Result<Vec<PciDevice>, HypervisorError>;

    async fn pci_unplug_begin(
        &self,
        domid: DomainId,
        device: &PciDevice,
    ) -> Result<(), HypervisorError>;

    /// Waits for a previously initiated hot-unplug to complete.
    async fn pci_unplug_wait(
        &self,
        domid: DomainId,
    ) -> Result<(), HypervisorError>;

    async fn pci_plug(
        &self,
        vm: &VmRef,
        domid: DomainId,
    ) -> Result<(), HypervisorError>;

    /// Rebalances memory between the domains on this host.
    async fn balance_memory(&self) -> Result<(), HypervisorError>;

    /// Migration memory estimator: KiB the destination must reserve
    /// before restoring this guest.
    async fn memory_required_kib(
        &self,
        boot: &BootRecord,
    ) -> Result<u64, HypervisorError>;
}
