// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory capability implementations backing the scenario tests: a
//! shared cluster database, a per-host hypervisor whose save/restore
//! moves a byte buffer over the real stream, a shared-SR storage backend
//! that tracks per-host attach/activate state, and recording event and
//! liaison sinks.
//!
//! The simulated SR records whether any VDI was ever activated on two
//! hosts at once, so tests can assert the unique-activation invariant
//! directly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use slog::Logger;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec::ByteStream;
use crate::db::{
    AccessMode, BootRecord, ClusterDb, HostRef, PowerState, SessionId,
    TaskId, VbdRecord, VbdRef, VdiRef, VifRef, VmRecord, VmRef,
};
use crate::events::{EventSink, TaskStatus};
use crate::hypervisor::{
    DestroyOpts, DomainId, Hypervisor, HypervisorError, PciDevice,
    ShutdownReason, SuspendHooks,
};
use crate::liaison::MigrationLiaison;
use crate::storage::{StorageBackend, StorageError, StorageOp};
use crate::{ClusterError, MigrateContext, MigrateError};

// ---------------------------------------------------------------------
// Cluster database

struct HostState {
    enabled: bool,
    address: String,
    cpu_flags: String,
}

#[derive(Default)]
struct ClusterState {
    vms: HashMap<VmRef, VmRecord>,
    boots: HashMap<VmRef, BootRecord>,
    vbds: HashMap<VbdRef, VbdRecord>,
    vifs: HashMap<VmRef, Vec<VifRef>>,
    hosts: HashMap<HostRef, HostState>,
    affinity: HashMap<VmRef, HostRef>,
    locks_taken: Vec<VmRef>,
    sessions_opened: Vec<SessionId>,
    sessions_released: Vec<SessionId>,
}

impl ClusterState {
    fn vm(&self, vm: &VmRef) -> Result<&VmRecord, ClusterError> {
        self.vms
            .get(vm)
            .ok_or_else(|| ClusterError::InternalError(format!("no VM {vm}")))
    }

    fn host(&self, host: &HostRef) -> Result<&HostState, ClusterError> {
        self.hosts.get(host).ok_or_else(|| {
            ClusterError::InternalError(format!("no host {host}"))
        })
    }
}

/// One host's view of the shared cluster database.
pub struct SimCluster {
    host: HostRef,
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl ClusterDb for SimCluster {
    fn local_host(&self) -> HostRef {
        self.host
    }

    async fn vm_record(&self, vm: &VmRef) -> Result<VmRecord, ClusterError> {
        let state = self.state.lock().unwrap();
        state.vm(vm).cloned()
    }

    async fn boot_record(
        &self,
        vm: &VmRef,
    ) -> Result<BootRecord, ClusterError> {
        let state = self.state.lock().unwrap();
        state.boots.get(vm).cloned().ok_or_else(|| {
            ClusterError::InternalError(format!("no boot record for {vm}"))
        })
    }

    async fn vbd_record(
        &self,
        vbd: &VbdRef,
    ) -> Result<VbdRecord, ClusterError> {
        let state = self.state.lock().unwrap();
        state.vbds.get(vbd).cloned().ok_or_else(|| {
            ClusterError::InternalError(format!("no VBD {vbd}"))
        })
    }

    async fn vifs_of(&self, vm: &VmRef) -> Result<Vec<VifRef>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.vifs.get(vm).cloned().unwrap_or_default())
    }

    async fn host_enabled(
        &self,
        host: &HostRef,
    ) -> Result<bool, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.host(host)?.enabled)
    }

    async fn host_address(
        &self,
        host: &HostRef,
    ) -> Result<String, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.host(host)?.address.clone())
    }

    async fn host_cpu_flags(
        &self,
        host: &HostRef,
    ) -> Result<String, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.host(host)?.cpu_flags.clone())
    }

    async fn set_affinity(
        &self,
        vm: &VmRef,
        host: &HostRef,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.vm(vm)?;
        state.affinity.insert(*vm, *host);
        Ok(())
    }

    async fn set_domid(
        &self,
        vm: &VmRef,
        domid: Option<DomainId>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        match state.vms.get_mut(vm) {
            Some(record) => {
                record.domid = domid;
                Ok(())
            }
            None => Err(ClusterError::InternalError(format!("no VM {vm}"))),
        }
    }

    async fn set_resident_on(
        &self,
        vm: &VmRef,
        host: &HostRef,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        match state.vms.get_mut(vm) {
            Some(record) => {
                record.resident_on = *host;
                Ok(())
            }
            None => Err(ClusterError::InternalError(format!("no VM {vm}"))),
        }
    }

    async fn force_power_state(
        &self,
        vm: &VmRef,
        power_state: PowerState,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        match state.vms.get_mut(vm) {
            Some(record) => {
                record.power_state = power_state;
                Ok(())
            }
            None => Err(ClusterError::InternalError(format!("no VM {vm}"))),
        }
    }

    async fn acquire_vm_lock(&self, vm: &VmRef) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.locks_taken.push(*vm);
        Ok(())
    }

    async fn release_vm_lock(&self, _vm: &VmRef) {}

    async fn session_for_host(
        &self,
        host: &HostRef,
    ) -> Result<SessionId, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.host(host)?;
        let session = SessionId::generate();
        state.sessions_opened.push(session);
        Ok(session)
    }

    async fn release_session(&self, session: &SessionId) {
        let mut state = self.state.lock().unwrap();
        state.sessions_released.push(*session);
    }
}

// ---------------------------------------------------------------------
// Hypervisor

/// A simulated domain. `memory` is the guest image the save writes and
/// the restore fills in.
#[derive(Clone, Debug)]
pub struct SimDomain {
    pub vm: VmRef,
    pub hvm: bool,
    pub memory: Vec<u8>,
    pub paused: bool,
    pub shutdown: Option<ShutdownReason>,
    pub reserved_kib: u64,
    pub devices_restored: bool,
}

#[derive(Default)]
struct HvState {
    next_domid: u32,
    next_devid: u32,
    domains: HashMap<DomainId, SimDomain>,
    destroyed: Vec<(DomainId, DestroyOpts)>,
    paused_vbds: HashSet<VbdRef>,
    pci: HashMap<DomainId, Vec<PciDevice>>,
    devids: HashMap<VbdRef, u32>,
    flushed: Vec<DomainId>,
    unplug_begun: Vec<PciDevice>,
    plugged: Vec<DomainId>,
    balanced: u32,
}

/// One host's hypervisor.
#[derive(Default)]
pub struct SimHypervisor {
    state: Mutex<HvState>,
}

impl SimHypervisor {
    /// Seeds a running guest, as if it had been started on this host.
    pub fn install_domain(
        &self,
        vm: VmRef,
        hvm: bool,
        memory: Vec<u8>,
    ) -> DomainId {
        let mut state = self.state.lock().unwrap();
        state.next_domid += 1;
        let domid = DomainId(state.next_domid);
        state.domains.insert(
            domid,
            SimDomain {
                vm,
                hvm,
                memory,
                paused: false,
                shutdown: None,
                reserved_kib: 0,
                devices_restored: false,
            },
        );
        domid
    }

    pub fn pause_vbd(&self, vbd: VbdRef) {
        self.state.lock().unwrap().paused_vbds.insert(vbd);
    }

    pub fn set_pci_devices(&self, domid: DomainId, devices: Vec<PciDevice>) {
        self.state.lock().unwrap().pci.insert(domid, devices);
    }

    pub fn domain(&self, domid: DomainId) -> Option<SimDomain> {
        self.state.lock().unwrap().domains.get(&domid).cloned()
    }

    pub fn domain_of_vm(&self, vm: VmRef) -> Option<(DomainId, SimDomain)> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .iter()
            .find(|(_, d)| d.vm == vm)
            .map(|(id, d)| (*id, d.clone()))
    }

    pub fn live_domain_count(&self) -> usize {
        self.state.lock().unwrap().domains.len()
    }

    pub fn destroyed_domains(&self) -> Vec<DomainId> {
        let state = self.state.lock().unwrap();
        state.destroyed.iter().map(|(id, _)| *id).collect()
    }

    pub fn flushed_domains(&self) -> Vec<DomainId> {
        self.state.lock().unwrap().flushed.clone()
    }

    pub fn unplugged_pci_devices(&self) -> Vec<PciDevice> {
        self.state.lock().unwrap().unplug_begun.clone()
    }

    pub fn plugged_domains(&self) -> Vec<DomainId> {
        self.state.lock().unwrap().plugged.clone()
    }

    pub fn memory_balance_count(&self) -> u32 {
        self.state.lock().unwrap().balanced
    }

    fn with_domain<R>(
        &self,
        op: &'static str,
        domid: DomainId,
        f: impl FnOnce(&mut SimDomain) -> R,
    ) -> Result<R, HypervisorError> {
        let mut state = self.state.lock().unwrap();
        match state.domains.get_mut(&domid) {
            Some(domain) => Ok(f(domain)),
            None => Err(HypervisorError::op(op, domid, "no such domain")),
        }
    }
}

#[async_trait]
impl Hypervisor for SimHypervisor {
    async fn is_hvm(&self, domid: DomainId) -> Result<bool, HypervisorError> {
        self.with_domain("query", domid, |d| d.hvm)
    }

    async fn vbd_device(
        &self,
        _domid: DomainId,
        vbd: &VbdRef,
    ) -> Result<u32, HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(devid) = state.devids.get(vbd) {
            return Ok(*devid);
        }
        state.next_devid += 16;
        let devid = 768 + state.next_devid;
        state.devids.insert(*vbd, devid);
        Ok(devid)
    }

    async fn vbd_paused(
        &self,
        _domid: DomainId,
        vbd: &VbdRef,
    ) -> Result<bool, HypervisorError> {
        Ok(self.state.lock().unwrap().paused_vbds.contains(vbd))
    }

    async fn suspend(
        &self,
        domid: DomainId,
        _hvm: bool,
        _live: bool,
        stream: &mut (dyn ByteStream + '_),
        hooks: &mut (dyn SuspendHooks + '_),
    ) -> Result<(), MigrateError> {
        // A domain that already went down cannot be suspended.
        let early = self.with_domain("suspend", domid, |d| d.shutdown)?;
        if let Some(observed) = early {
            if observed != ShutdownReason::Suspend {
                return Err(HypervisorError::ShutdownWrongReason {
                    expected: ShutdownReason::Suspend,
                    observed,
                }
                .into());
            }
        }

        for fraction in [0.25, 0.5, 0.75, 0.9] {
            hooks.progress(fraction).await?;
        }
        hooks.before_final_pause().await?;

        let memory = {
            let state = self.state.lock().unwrap();
            let domain = state.domains.get(&domid).ok_or_else(|| {
                HypervisorError::op("suspend", domid, "no such domain")
            })?;
            match domain.shutdown {
                Some(ShutdownReason::Suspend) => {}
                Some(observed) => {
                    return Err(HypervisorError::ShutdownWrongReason {
                        expected: ShutdownReason::Suspend,
                        observed,
                    }
                    .into())
                }
                None => {
                    return Err(HypervisorError::op(
                        "suspend",
                        domid,
                        "guest never shut down",
                    )
                    .into())
                }
            }
            domain.memory.clone()
        };
        hooks.progress(1.0).await?;

        let io_err =
            |e: std::io::Error| HypervisorError::op("suspend", domid, e);
        stream
            .write_all(&(memory.len() as u64).to_be_bytes())
            .await
            .map_err(io_err)?;
        stream.write_all(&memory).await.map_err(io_err)?;
        stream.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn shutdown_domain(
        &self,
        domid: DomainId,
        reason: ShutdownReason,
    ) -> Result<(), HypervisorError> {
        self.with_domain("shutdown", domid, |d| d.shutdown = Some(reason))
    }

    async fn hard_shutdown_vbds(
        &self,
        domid: DomainId,
        _devices: &[u32],
        _extra_debug_paths: &[String],
    ) -> Result<(), HypervisorError> {
        self.state.lock().unwrap().flushed.push(domid);
        Ok(())
    }

    async fn create_domain(
        &self,
        vm: &VmRef,
        boot: &BootRecord,
    ) -> Result<DomainId, HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.next_domid += 1;
        let domid = DomainId(state.next_domid);
        state.domains.insert(
            domid,
            SimDomain {
                vm: *vm,
                hvm: boot.hvm,
                memory: Vec::new(),
                paused: true,
                shutdown: None,
                reserved_kib: 0,
                devices_restored: false,
            },
        );
        Ok(domid)
    }

    async fn reserve_memory(
        &self,
        domid: DomainId,
        kib: u64,
    ) -> Result<(), HypervisorError> {
        self.with_domain("reserve", domid, |d| d.reserved_kib = kib)
    }

    async fn restore_devices(
        &self,
        _vm: &VmRef,
        domid: DomainId,
        _vbds: &[VbdRef],
        _vifs: &[VifRef],
    ) -> Result<(), HypervisorError> {
        self.with_domain("restore-devices", domid, |d| {
            d.devices_restored = true
        })
    }

    async fn restore(
        &self,
        domid: DomainId,
        stream: &mut (dyn ByteStream + '_),
    ) -> Result<(), HypervisorError> {
        let io_err =
            |e: std::io::Error| HypervisorError::op("restore", domid, e);
        let mut len_buf = [0u8; 8];
        stream.read_exact(&mut len_buf).await.map_err(io_err)?;
        let len = u64::from_be_bytes(len_buf) as usize;
        let mut memory = vec![0u8; len];
        stream.read_exact(&mut memory).await.map_err(io_err)?;
        self.with_domain("restore", domid, |d| d.memory = memory)
    }

    async fn unpause(&self, domid: DomainId) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        match state.domains.get_mut(&domid) {
            Some(domain) => {
                if domain.shutdown == Some(ShutdownReason::Crashed) {
                    Err(HypervisorError::op(
                        "unpause",
                        domid,
                        "domain has crashed",
                    ))
                } else {
                    domain.paused = false;
                    Ok(())
                }
            }
            None => {
                Err(HypervisorError::op("unpause", domid, "no such domain"))
            }
        }
    }

    async fn destroy_domain(
        &self,
        domid: DomainId,
        opts: DestroyOpts,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.domains.remove(&domid);
        state.destroyed.push((domid, opts));
        Ok(())
    }

    async fn pci_list(
        &self,
        domid: DomainId,
    ) -> Result<Vec<PciDevice>, HypervisorError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pci
            .get(&domid)
            .cloned()
            .unwrap_or_default())
    }

    async fn pci_unplug_begin(
        &self,
        _domid: DomainId,
        device: &PciDevice,
    ) -> Result<(), HypervisorError> {
        self.state.lock().unwrap().unplug_begun.push(device.clone());
        Ok(())
    }

    async fn pci_unplug_wait(
        &self,
        _domid: DomainId,
    ) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn pci_plug(
        &self,
        _vm: &VmRef,
        domid: DomainId,
    ) -> Result<(), HypervisorError> {
        self.state.lock().unwrap().plugged.push(domid);
        Ok(())
    }

    async fn balance_memory(&self) -> Result<(), HypervisorError> {
        self.state.lock().unwrap().balanced += 1;
        Ok(())
    }

    async fn memory_required_kib(
        &self,
        boot: &BootRecord,
    ) -> Result<u64, HypervisorError> {
        Ok(boot.memory_static_max_kib)
    }
}

// ---------------------------------------------------------------------
// Storage

#[derive(Clone, Copy, Default)]
struct VdiHostState {
    attach_count: u32,
    activated: bool,
}

#[derive(Default)]
struct SrState {
    activate_capability: bool,
    vdis: HashMap<(HostRef, VdiRef), VdiHostState>,
    fail_attach: HashSet<VdiRef>,
    double_activation: bool,
}

/// One host's handle on the shared SR.
pub struct SimStorage {
    host: HostRef,
    sr: Arc<Mutex<SrState>>,
}

#[async_trait]
impl StorageBackend for SimStorage {
    async fn attach(
        &self,
        vdi: &VdiRef,
        _mode: AccessMode,
    ) -> Result<(), StorageError> {
        let mut sr = self.sr.lock().unwrap();
        if sr.fail_attach.contains(vdi) {
            return Err(StorageError::new(
                StorageOp::Attach,
                *vdi,
                "backend refused attach",
            ));
        }
        sr.vdis.entry((self.host, *vdi)).or_default().attach_count += 1;
        Ok(())
    }

    async fn detach(&self, vdi: &VdiRef) -> Result<(), StorageError> {
        let mut sr = self.sr.lock().unwrap();
        let Some(state) = sr.vdis.get_mut(&(self.host, *vdi)) else {
            return Ok(());
        };
        match state.attach_count {
            // Detaching the never-attached is a no-op.
            0 => Ok(()),
            1 if state.activated => Err(StorageError::new(
                StorageOp::Detach,
                *vdi,
                "VDI is still activated",
            )),
            _ => {
                state.attach_count -= 1;
                Ok(())
            }
        }
    }

    async fn activate(&self, vdi: &VdiRef) -> Result<(), StorageError> {
        let mut sr = self.sr.lock().unwrap();
        if !sr.activate_capability {
            return Ok(());
        }
        match sr.vdis.get_mut(&(self.host, *vdi)) {
            Some(state) if state.attach_count > 0 => state.activated = true,
            _ => {
                return Err(StorageError::new(
                    StorageOp::Activate,
                    *vdi,
                    "VDI is not attached",
                ))
            }
        }
        let hosts_active = sr
            .vdis
            .iter()
            .filter(|((_, v), s)| v == vdi && s.activated)
            .count();
        if hosts_active > 1 {
            sr.double_activation = true;
        }
        Ok(())
    }

    async fn deactivate(&self, vdi: &VdiRef) -> Result<(), StorageError> {
        let mut sr = self.sr.lock().unwrap();
        if !sr.activate_capability {
            return Ok(());
        }
        if let Some(state) = sr.vdis.get_mut(&(self.host, *vdi)) {
            state.activated = false;
        }
        Ok(())
    }

    async fn sr_has_activate_capability(
        &self,
        _vdi: &VdiRef,
    ) -> Result<bool, StorageError> {
        Ok(self.sr.lock().unwrap().activate_capability)
    }
}

// ---------------------------------------------------------------------
// Events and liaison

#[derive(Default)]
struct EventsState {
    progress: HashMap<TaskId, Vec<f64>>,
    statuses: Vec<(TaskId, TaskStatus)>,
    rrd_pushes: Vec<(VmRef, HostRef)>,
    hooks_run: Vec<VmRef>,
    remote_errors: HashMap<TaskId, ClusterError>,
    cancelled: HashSet<TaskId>,
}

/// A recording task/event sink shared by every host in the world.
#[derive(Default)]
pub struct SimEvents {
    state: Mutex<EventsState>,
}

impl SimEvents {
    pub fn progress_for(&self, task: &TaskId) -> Vec<f64> {
        self.state
            .lock()
            .unwrap()
            .progress
            .get(task)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statuses_for(&self, task: &TaskId) -> Vec<TaskStatus> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .iter()
            .filter(|(t, _)| t == task)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn rrd_pushes(&self) -> Vec<(VmRef, HostRef)> {
        self.state.lock().unwrap().rrd_pushes.clone()
    }

    pub fn hooks_run(&self) -> Vec<VmRef> {
        self.state.lock().unwrap().hooks_run.clone()
    }

    pub fn set_remote_error(&self, task: TaskId, error: ClusterError) {
        self.state.lock().unwrap().remote_errors.insert(task, error);
    }

    /// Marks the task cancelled, as the cluster task system would when
    /// its owner cancels it.
    pub fn cancel_task(&self, task: TaskId) {
        self.state.lock().unwrap().cancelled.insert(task);
    }
}

#[async_trait]
impl EventSink for SimEvents {
    async fn progress(&self, task: &TaskId, fraction: f64) {
        self.state
            .lock()
            .unwrap()
            .progress
            .entry(*task)
            .or_default()
            .push(fraction);
    }

    async fn task_status(&self, task: &TaskId, status: TaskStatus) {
        self.state.lock().unwrap().statuses.push((*task, status));
    }

    async fn task_cancelled(&self, task: &TaskId) -> bool {
        self.state.lock().unwrap().cancelled.contains(task)
    }

    async fn push_rrd(
        &self,
        _session: &SessionId,
        vm: &VmRef,
        destination: &HostRef,
    ) -> Result<(), ClusterError> {
        self.state.lock().unwrap().rrd_pushes.push((*vm, *destination));
        Ok(())
    }

    async fn pre_migrate_hook(&self, vm: &VmRef) -> Result<(), ClusterError> {
        self.state.lock().unwrap().hooks_run.push(*vm);
        Ok(())
    }

    async fn remote_task_error(
        &self,
        _session: &SessionId,
        task: &TaskId,
    ) -> Option<ClusterError> {
        self.state.lock().unwrap().remote_errors.get(task).cloned()
    }
}

/// A liaison that acknowledges suspends immediately unless told to
/// withhold, and whose abort flag tests can raise.
pub struct SimLiaison {
    abort: AtomicBool,
    ack: AtomicBool,
    notified: AtomicBool,
}

impl Default for SimLiaison {
    fn default() -> Self {
        SimLiaison {
            abort: AtomicBool::new(false),
            ack: AtomicBool::new(true),
            notified: AtomicBool::new(false),
        }
    }
}

impl SimLiaison {
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn withhold_ack(&self) {
        self.ack.store(false, Ordering::SeqCst);
    }

    pub fn was_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MigrationLiaison for SimLiaison {
    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    async fn notify_entering_suspend(&self, _vm: &VmRef) {
        self.notified.store(true, Ordering::SeqCst);
    }

    async fn await_suspend_ack(&self, _vm: &VmRef) {
        if !self.ack.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------
// World

/// A whole simulated cluster: a shared database and SR plus per-host
/// hypervisors, storage handles and liaisons.
pub struct SimWorld {
    cluster: Arc<Mutex<ClusterState>>,
    sr: Arc<Mutex<SrState>>,
    pub events: Arc<SimEvents>,
    hypervisors: HashMap<HostRef, Arc<SimHypervisor>>,
    storages: HashMap<HostRef, Arc<SimStorage>>,
    liaisons: HashMap<HostRef, Arc<SimLiaison>>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWorld {
    pub fn new() -> Self {
        SimWorld {
            cluster: Arc::default(),
            sr: Arc::default(),
            events: Arc::default(),
            hypervisors: HashMap::new(),
            storages: HashMap::new(),
            liaisons: HashMap::new(),
        }
    }

    /// Gives the shared SR the activate capability. Call before seeding
    /// VMs so their VDIs start out activated on the source host.
    pub fn set_activate_capability(&self) {
        self.sr.lock().unwrap().activate_capability = true;
    }

    pub fn add_host(&mut self) -> HostRef {
        let host = HostRef::generate();
        self.cluster.lock().unwrap().hosts.insert(
            host,
            HostState {
                enabled: true,
                address: String::new(),
                cpu_flags: "fpu vme de pse tsc msr".to_string(),
            },
        );
        self.hypervisors.insert(host, Arc::new(SimHypervisor::default()));
        self.storages.insert(
            host,
            Arc::new(SimStorage { host, sr: Arc::clone(&self.sr) }),
        );
        self.liaisons.insert(host, Arc::new(SimLiaison::default()));
        host
    }

    pub fn set_host_address(&self, host: HostRef, address: String) {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(state) = cluster.hosts.get_mut(&host) {
            state.address = address;
        }
    }

    pub fn disable_host(&self, host: HostRef) {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(state) = cluster.hosts.get_mut(&host) {
            state.enabled = false;
        }
    }

    pub fn set_cpu_flags(&self, host: HostRef, flags: &str) {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(state) = cluster.hosts.get_mut(&host) {
            state.cpu_flags = flags.to_string();
        }
    }

    pub fn hypervisor(&self, host: HostRef) -> Arc<SimHypervisor> {
        Arc::clone(&self.hypervisors[&host])
    }

    pub fn storage(&self, host: HostRef) -> Arc<SimStorage> {
        Arc::clone(&self.storages[&host])
    }

    pub fn liaison(&self, host: HostRef) -> Arc<SimLiaison> {
        Arc::clone(&self.liaisons[&host])
    }

    /// A capability context for code running on `host` under `task`.
    pub fn context(
        &self,
        host: HostRef,
        task: TaskId,
        log: &Logger,
    ) -> MigrateContext {
        MigrateContext {
            db: Arc::new(SimCluster {
                host,
                state: Arc::clone(&self.cluster),
            }),
            hypervisor: self.hypervisor(host),
            storage: self.storage(host),
            events: Arc::clone(&self.events) as Arc<dyn EventSink>,
            liaison: self.liaison(host),
            task,
            log: log.clone(),
        }
    }

    /// Seeds a running guest on `host` with `disks` RW disks and the
    /// given memory image, attached (and activated, on capable SRs) the
    /// way a started VM would be.
    pub fn add_running_vm(
        &self,
        host: HostRef,
        disks: usize,
        memory: Vec<u8>,
    ) -> VmRef {
        let vm = VmRef::generate();
        let domid = self.hypervisor(host).install_domain(vm, true, memory);

        let activated = self.sr.lock().unwrap().activate_capability;
        let mut vbds = Vec::new();
        {
            let mut cluster = self.cluster.lock().unwrap();
            let mut sr = self.sr.lock().unwrap();
            for _ in 0..disks {
                let vbd = VbdRef::generate();
                let vdi = VdiRef::generate();
                cluster.vbds.insert(
                    vbd,
                    VbdRecord {
                        vbd,
                        vdi: Some(vdi),
                        currently_attached: true,
                        mode: AccessMode::Rw,
                        empty: false,
                    },
                );
                sr.vdis.insert(
                    (host, vdi),
                    VdiHostState { attach_count: 1, activated },
                );
                vbds.push(vbd);
            }
            cluster.vms.insert(
                vm,
                VmRecord {
                    vm,
                    name_label: format!("guest-{}", domid),
                    power_state: PowerState::Running,
                    resident_on: host,
                    domid: Some(domid),
                    vbds,
                    other_config: BTreeMap::new(),
                },
            );
            cluster.boots.insert(
                vm,
                BootRecord {
                    name_label: format!("guest-{}", domid),
                    hvm: true,
                    vcpus: 2,
                    memory_static_max_kib: 1 << 20,
                },
            );
            cluster.vifs.insert(vm, vec![VifRef::generate()]);
        }
        vm
    }

    pub fn add_halted_vm(&self, host: HostRef) -> VmRef {
        let vm = VmRef::generate();
        let mut cluster = self.cluster.lock().unwrap();
        cluster.vms.insert(
            vm,
            VmRecord {
                vm,
                name_label: "halted-guest".to_string(),
                power_state: PowerState::Halted,
                resident_on: host,
                domid: None,
                vbds: Vec::new(),
                other_config: BTreeMap::new(),
            },
        );
        cluster.boots.insert(
            vm,
            BootRecord {
                name_label: "halted-guest".to_string(),
                hvm: true,
                vcpus: 1,
                memory_static_max_kib: 1 << 18,
            },
        );
        vm
    }

    pub fn vm_record(&self, vm: VmRef) -> VmRecord {
        self.cluster.lock().unwrap().vms[&vm].clone()
    }

    pub fn set_other_config(&self, vm: VmRef, key: &str, value: &str) {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(record) = cluster.vms.get_mut(&vm) {
            record.other_config.insert(key.to_string(), value.to_string());
        }
    }

    pub fn vdis_of(&self, vm: VmRef) -> Vec<VdiRef> {
        let cluster = self.cluster.lock().unwrap();
        cluster.vms[&vm]
            .vbds
            .iter()
            .filter_map(|vbd| cluster.vbds[vbd].vdi)
            .collect()
    }

    pub fn fail_attach(&self, vdi: VdiRef) {
        self.sr.lock().unwrap().fail_attach.insert(vdi);
    }

    /// (attach_count, activated) for a VDI on a host.
    pub fn vdi_state(&self, host: HostRef, vdi: VdiRef) -> (u32, bool) {
        let sr = self.sr.lock().unwrap();
        sr.vdis
            .get(&(host, vdi))
            .map(|s| (s.attach_count, s.activated))
            .unwrap_or((0, false))
    }

    /// Whether any VDI was ever activated on two hosts at once.
    pub fn double_activation(&self) -> bool {
        self.sr.lock().unwrap().double_activation
    }

    pub fn affinity_of(&self, vm: VmRef) -> Option<HostRef> {
        self.cluster.lock().unwrap().affinity.get(&vm).copied()
    }

    pub fn locks_taken(&self) -> Vec<VmRef> {
        self.cluster.lock().unwrap().locks_taken.clone()
    }

    /// (opened, released) secure RPC session counts.
    pub fn session_counts(&self) -> (usize, usize) {
        let cluster = self.cluster.lock().unwrap();
        (cluster.sessions_opened.len(), cluster.sessions_released.len())
    }
}
