// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster database capability and the records the engine reads
//! through it. The engine never caches records across barriers; each side
//! re-reads what it needs when it needs it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hypervisor::DomainId;
use crate::ClusterError;

macro_rules! cluster_ref {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

cluster_ref!(
    /// Opaque identity of a guest in the cluster database.
    VmRef
);
cluster_ref!(
    /// A guest disk attachment.
    VbdRef
);
cluster_ref!(
    /// A virtual disk image.
    VdiRef
);
cluster_ref!(
    /// A guest network interface.
    VifRef
);
cluster_ref!(
    /// A hypervisor host in the cluster.
    HostRef
);
cluster_ref!(
    /// A cluster task.
    TaskId
);
cluster_ref!(
    /// An authenticated session on a remote host.
    SessionId
);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Suspended,
    Running,
    Paused,
}

/// Disk access mode, for both VBDs and VDI attachments.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccessMode {
    Ro,
    Rw,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm: VmRef,
    pub name_label: String,
    pub power_state: PowerState,
    /// The host currently running the VM. Its atomic update at the end of
    /// the receiver is the logical completion of a migration.
    pub resident_on: HostRef,
    pub domid: Option<DomainId>,
    pub vbds: Vec<VbdRef>,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VbdRecord {
    pub vbd: VbdRef,
    /// Empty VBDs (removable media with nothing inserted) have no VDI.
    pub vdi: Option<VdiRef>,
    pub currently_attached: bool,
    pub mode: AccessMode,
    pub empty: bool,
}

/// The boot-record snapshot used as the create template for the
/// destination's proto-domain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootRecord {
    pub name_label: String,
    pub hvm: bool,
    pub vcpus: u32,
    pub memory_static_max_kib: u64,
}

#[async_trait]
pub trait ClusterDb: Send + Sync {
    /// The host this capability runs on.
    fn local_host(&self) -> HostRef;

    async fn vm_record(&self, vm: &VmRef) -> Result<VmRecord, ClusterError>;

    async fn boot_record(&self, vm: &VmRef)
        -> Result<BootRecord, ClusterError>;

    async fn vbd_record(&self, vbd: &VbdRef)
        -> Result<VbdRecord, ClusterError>;

    async fn vifs_of(&self, vm: &VmRef) -> Result<Vec<VifRef>, ClusterError>;

    async fn host_enabled(&self, host: &HostRef)
        -> Result<bool, ClusterError>;

    async fn host_address(&self, host: &HostRef)
        -> Result<String, ClusterError>;

    async fn host_cpu_flags(&self, host: &HostRef)
        -> Result<String, ClusterError>;

    async fn set_affinity(
        &self,
        vm: &VmRef,
        host: &HostRef,
    ) -> Result<(), ClusterError>;

    async fn set_domid(
        &self,
        vm: &VmRef,
        domid: Option<DomainId>,
    ) -> Result<(), ClusterError>;

    /// Atomically rebinds the VM record to a new host.
    async fn set_resident_on(
        &self,
        vm: &VmRef,
        host: &HostRef,
    ) -> Result<(), ClusterError>;

    /// Forces the recorded power state without consulting the hypervisor.
    async fn force_power_state(
        &self,
        vm: &VmRef,
        state: PowerState,
    ) -> Result<(), ClusterError>;

    async fn acquire_vm_lock(&self, vm: &VmRef) -> Result<(), ClusterError>;

    async fn release_vm_lock(&self, vm: &VmRef);

    /// Logs in to a remote host over the separate secure RPC channel.
    async fn session_for_host(
        &self,
        host: &HostRef,
    ) -> Result<SessionId, ClusterError>;

    async fn release_session(&self, session: &SessionId);

    /// Destination-side identity remap for protected VMs. Identity unless
    /// a protected-VM subsystem routes the migration to a distinct record.
    async fn peer_lookup(&self, vm: &VmRef) -> Result<VmRef, ClusterError> {
        Ok(*vm)
    }

    /// Post-adoption bookkeeping for protected VMs.
    async fn update_peer_state(&self, _vm: &VmRef) -> Result<(), ClusterError> {
        Ok(())
    }
}
