// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source-side transmitter choreography.
//!
//! The transmitter waits for the destination to report readiness (barrier
//! [1]), drives the hypervisor's save routine to stream the memory image
//! (barrier [2] is the save returning), then runs the post-suspend
//! hand-over: disk flush, deactivation, barrier [3] (the point of no
//! return), best-effort detach and RRD push, and barrier [4] once the
//! destination has adopted the VM record. A guaranteed-release block undoes
//! whatever the ledger says is still held on any exit from the hand-over.

use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, o, warn, Logger};
use tokio::time::timeout;

use crate::codec::{ByteStream, Handshake, Message};
use crate::config;
use crate::db::{
    AccessMode, HostRef, PowerState, SessionId, TaskId, VdiRef, VmRecord,
    VmRef,
};
use crate::events::EventSink;
use crate::failure_injection::{self, FaultPoint};
use crate::hypervisor::{
    DestroyOpts, DomainId, Hypervisor, HypervisorError, PciDevice,
    ShutdownReason, SuspendHooks,
};
use crate::ledger::SourceLedger;
use crate::liaison::MigrationLiaison;
use crate::{ClusterError, MigrateContext, MigrateError, MigrateRole};

/// How long the guest has to acknowledge the suspend request.
const SUSPEND_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the suspend-ack wait re-polls the external abort flag.
const ABORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fraction of the task's progress range owned by the memory-image save.
const SAVE_PROGRESS_SHARE: f64 = 0.95;

/// Runs the transmitter over an established stream to the destination.
///
/// On failure past barrier [3] the destination owns the guest, so the
/// local VM record is forced to Halted before the error is surfaced.
pub async fn transmit<T: ByteStream>(
    ctx: &MigrateContext,
    vm: VmRef,
    destination: HostRef,
    session: SessionId,
    is_live: bool,
    is_localhost: bool,
    stream: T,
) -> Result<(), MigrateError> {
    let log = ctx
        .log
        .new(o!("migrate_role" => "source", "vm" => vm.to_string()));
    info!(log, "entering source migration task"; "live" => is_live);

    let mut proto = SourceProtocol {
        ctx,
        log: log.clone(),
        vm,
        destination,
        session,
        is_live,
        is_localhost,
        chan: Handshake::new(stream, MigrateRole::Destination),
        past_handover: false,
    };

    match proto.run().await {
        Ok(()) => {
            info!(log, "source migration successful");
            Ok(())
        }
        Err(err) => Err(proto.classify(err).await),
    }
}

/// Everything the pre-work resolves before the guest is touched.
struct SourcePlan {
    record: VmRecord,
    domid: DomainId,
    hvm: bool,
    /// Derived device numbers for the attached RW VBDs.
    devices: Vec<u32>,
    /// The VDIs backing those VBDs.
    vdis: Vec<VdiRef>,
    extra_debug_paths: Vec<String>,
}

struct SourceProtocol<'a, T> {
    ctx: &'a MigrateContext,
    log: Logger,
    vm: VmRef,
    destination: HostRef,
    session: SessionId,
    is_live: bool,
    is_localhost: bool,
    chan: Handshake<T>,
    /// Set once barrier [3] has been sent: guest identity now belongs to
    /// the destination.
    past_handover: bool,
}

impl<'a, T: ByteStream> SourceProtocol<'a, T> {
    async fn run(&mut self) -> Result<(), MigrateError> {
        let plan = self.prepare().await?;
        self.await_destination_ready().await?;
        self.suspend_guest(&plan).await?;

        let mut ledger = SourceLedger::new(self.is_localhost);
        let res = self.hand_over(&plan, &mut ledger).await;
        self.release(&plan, &ledger).await;
        res
    }

    /// Pre-work: nothing here mutates the guest.
    async fn prepare(&mut self) -> Result<SourcePlan, MigrateError> {
        let record = self.ctx.db.vm_record(&self.vm).await?;
        let domid = record.domid.ok_or_else(|| {
            MigrateError::Cluster(ClusterError::InternalError(format!(
                "VM {} has no running domain",
                self.vm
            )))
        })?;
        let hvm = self.ctx.hypervisor.is_hvm(domid).await?;

        let mut devices = Vec::new();
        let mut vdis = Vec::new();
        for vbd in &record.vbds {
            let vbd_record = self.ctx.db.vbd_record(vbd).await?;
            if !vbd_record.currently_attached
                || vbd_record.mode != AccessMode::Rw
                || vbd_record.empty
            {
                continue;
            }
            let Some(vdi) = vbd_record.vdi else { continue };
            devices.push(self.ctx.hypervisor.vbd_device(domid, vbd).await?);
            vdis.push(vdi);
        }

        let extra_debug_paths = config::extra_debug_paths(&record);
        failure_injection::fail_if_armed(
            &self.log,
            &record,
            FaultPoint::BeforeSuspend,
        )?;

        info!(
            self.log, "transmitter ready";
            "domid" => %domid, "hvm" => hvm, "vdis" => vdis.len()
        );
        Ok(SourcePlan { record, domid, hvm, devices, vdis, extra_debug_paths })
    }

    /// Barrier [1]: the destination has reserved memory, created the
    /// proto-domain, attached disks and (unless delayed) restored devices.
    async fn await_destination_ready(&mut self) -> Result<(), MigrateError> {
        match self.chan.recv().await.map_err(MigrateError::from)? {
            Message::Success => {
                info!(self.log, "destination ready");
                Ok(())
            }
            Message::Error(msg) => {
                error!(
                    self.log, "destination failed to prepare";
                    "error" => &msg
                );
                Err(MigrateError::Remote(MigrateRole::Destination, msg))
            }
        }
    }

    /// Streams the memory image. The save returning is barrier [2]: the
    /// image is fully written and the guest shut down with reason Suspend.
    async fn suspend_guest(
        &mut self,
        plan: &SourcePlan,
    ) -> Result<(), MigrateError> {
        if failure_injection::armed(&plan.record, FaultPoint::CrashDuringSuspend)
        {
            warn!(self.log, "failure injection: crashing domain at suspend");
            self.ctx
                .hypervisor
                .shutdown_domain(plan.domid, ShutdownReason::Crashed)
                .await?;
        }

        let pci_devices = self.ctx.hypervisor.pci_list(plan.domid).await?;
        let mut hooks = SourceSuspendHooks {
            hypervisor: Arc::clone(&self.ctx.hypervisor),
            events: Arc::clone(&self.ctx.events),
            liaison: Arc::clone(&self.ctx.liaison),
            log: self.log.clone(),
            task: self.ctx.task,
            vm: self.vm,
            domid: plan.domid,
            pci_devices,
            hotunplug_time: config::pci_hotunplug_time(
                &self.log,
                &plan.record,
            ),
            unplug_started: false,
        };

        let hv = Arc::clone(&self.ctx.hypervisor);
        hv.suspend(
            plan.domid,
            plan.hvm,
            self.is_live,
            self.chan.inner_mut(),
            &mut hooks,
        )
        .await?;
        info!(self.log, "memory image delivered, guest suspended");
        Ok(())
    }

    /// The post-suspend sequence. The ledger records what remains held at
    /// every step so that `release` can undo exactly that.
    async fn hand_over(
        &mut self,
        plan: &SourcePlan,
        ledger: &mut SourceLedger,
    ) -> Result<(), MigrateError> {
        failure_injection::fail_if_armed(
            &self.log,
            &plan.record,
            FaultPoint::BeforeFlush,
        )?;

        self.ctx
            .hypervisor
            .hard_shutdown_vbds(
                plan.domid,
                &plan.devices,
                &plan.extra_debug_paths,
            )
            .await?;

        ledger.deactivate_in_finally = false;
        if !self.is_localhost {
            for vdi in &plan.vdis {
                self.ctx.storage.deactivate(vdi).await?;
            }
        }

        // Barrier [3]: guest identity transfers to the destination.
        self.chan
            .send(Message::Success)
            .await
            .map_err(MigrateError::from)?;
        self.past_handover = true;
        info!(self.log, "ownership handed to destination");

        for vdi in &plan.vdis {
            if let Err(e) = self.ctx.storage.detach(vdi).await {
                warn!(
                    self.log, "failed to detach VDI after hand-over";
                    "vdi" => %vdi, "error" => %e
                );
            }
        }
        ledger.detach_in_finally = false;

        if let Err(e) = self
            .ctx
            .events
            .push_rrd(&self.session, &self.vm, &self.destination)
            .await
        {
            warn!(self.log, "failed to push RRDs"; "error" => %e);
        }

        // Barrier [4]: the destination has adopted the VM record.
        self.chan.recv_success().await?;
        info!(self.log, "destination adopted the VM");
        Ok(())
    }

    /// Guaranteed release: runs on every exit from the hand-over. Each
    /// step is best-effort and never masks the error being carried.
    async fn release(&mut self, plan: &SourcePlan, ledger: &SourceLedger) {
        if ledger.deactivate_in_finally {
            for vdi in &plan.vdis {
                if let Err(e) = self.ctx.storage.deactivate(vdi).await {
                    warn!(
                        self.log, "cleanup: failed to deactivate VDI";
                        "vdi" => %vdi, "error" => %e
                    );
                }
            }
        }
        if ledger.detach_in_finally {
            for vdi in &plan.vdis {
                if let Err(e) = self.ctx.storage.detach(vdi).await {
                    warn!(
                        self.log, "cleanup: failed to detach VDI";
                        "vdi" => %vdi, "error" => %e
                    );
                }
            }
        }

        let opts = DestroyOpts {
            preserve_xenstore: self.is_localhost,
            detach_devices: !self.is_localhost,
            deactivate_devices: ledger.deactivate_in_finally,
        };
        if let Err(e) =
            self.ctx.hypervisor.destroy_domain(plan.domid, opts).await
        {
            warn!(
                self.log, "cleanup: failed to destroy local domain";
                "domid" => %plan.domid, "error" => %e
            );
        }
    }

    /// Maps a protocol failure to what the caller should see, forcing the
    /// local record to Halted when the destination already owns the guest.
    async fn classify(&self, err: MigrateError) -> MigrateError {
        match err {
            MigrateError::Hypervisor(HypervisorError::ShutdownWrongReason {
                observed: ShutdownReason::Crashed,
                ..
            }) => {
                // The event thread applies actions_after_crash; no forced
                // state reset here.
                error!(self.log, "domain crashed during suspend");
                MigrateError::DomainCrashed
            }
            e @ MigrateError::Hypervisor(
                HypervisorError::ShutdownWrongReason { .. },
            ) => e,
            e @ MigrateError::Cluster(_) => e,
            e => {
                if self.past_handover {
                    error!(
                        self.log,
                        "migration failed after hand-over, forcing Halted";
                        "error" => %e
                    );
                    if let Err(reset) = self
                        .ctx
                        .db
                        .force_power_state(&self.vm, PowerState::Halted)
                        .await
                    {
                        warn!(
                            self.log, "failed to force local power state";
                            "error" => %reset
                        );
                    }
                }
                e
            }
        }
    }
}

/// The callbacks the hypervisor's save routine drives. Composed here and
/// not in the transmitter body: the save invokes them from inside its own
/// copy loop.
struct SourceSuspendHooks {
    hypervisor: Arc<dyn Hypervisor>,
    events: Arc<dyn EventSink>,
    liaison: Arc<dyn MigrationLiaison>,
    log: Logger,
    task: TaskId,
    vm: VmRef,
    domid: DomainId,
    pci_devices: Vec<PciDevice>,
    hotunplug_time: f64,
    unplug_started: bool,
}

#[async_trait::async_trait]
impl SuspendHooks for SourceSuspendHooks {
    async fn progress(&mut self, fraction: f64) -> Result<(), MigrateError> {
        if self.events.task_cancelled(&self.task).await {
            return Err(ClusterError::TaskCancelled.into());
        }
        if self.liaison.abort_requested() {
            return Err(MigrateError::Aborted);
        }
        self.events
            .progress(&self.task, fraction * SAVE_PROGRESS_SHARE)
            .await;
        if fraction > self.hotunplug_time {
            self.begin_pci_unplug().await;
        }
        Ok(())
    }

    async fn before_final_pause(&mut self) -> Result<(), MigrateError> {
        self.begin_pci_unplug().await;
        if self.unplug_started {
            if let Err(e) = self.hypervisor.pci_unplug_wait(self.domid).await {
                warn!(
                    self.log, "PCI hot-unplug did not complete";
                    "error" => %e
                );
            }
        }
        self.suspend_ack().await?;
        // Acked: ask the guest to complete a clean suspend shutdown.
        self.hypervisor
            .shutdown_domain(self.domid, ShutdownReason::Suspend)
            .await?;
        Ok(())
    }
}

impl SourceSuspendHooks {
    /// One-shot and best-effort. The hot-unplug protocol handles a single
    /// device; extras are warned about and dropped.
    async fn begin_pci_unplug(&mut self) {
        if self.unplug_started || self.pci_devices.is_empty() {
            return;
        }
        self.unplug_started = true;
        if self.pci_devices.len() > 1 {
            warn!(
                self.log,
                "PCI hot-unplug supports a single device; ignoring {} more",
                self.pci_devices.len() - 1
            );
        }
        let device = &self.pci_devices[0];
        info!(self.log, "initiating PCI hot-unplug"; "device" => &device.0);
        if let Err(e) =
            self.hypervisor.pci_unplug_begin(self.domid, device).await
        {
            warn!(
                self.log, "failed to begin PCI hot-unplug";
                "device" => &device.0, "error" => %e
            );
        }
    }

    /// Notifies the liaison that the guest is entering full suspend, then
    /// waits for the acknowledgement, a timeout or an external abort.
    async fn suspend_ack(&self) -> Result<(), MigrateError> {
        self.liaison.notify_entering_suspend(&self.vm).await;
        if self.events.task_cancelled(&self.task).await {
            return Err(ClusterError::TaskCancelled.into());
        }

        let liaison = Arc::clone(&self.liaison);
        let vm = self.vm;
        let acked = async move { liaison.await_suspend_ack(&vm).await };

        let liaison = Arc::clone(&self.liaison);
        let abort = async move {
            loop {
                if liaison.abort_requested() {
                    break;
                }
                tokio::time::sleep(ABORT_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            res = timeout(SUSPEND_ACK_TIMEOUT, acked) => match res {
                Ok(()) => {
                    info!(self.log, "guest acknowledged suspend");
                    Ok(())
                }
                Err(_) => Err(MigrateError::SuspendAckTimeout(
                    SUSPEND_ACK_TIMEOUT.as_secs(),
                )),
            },
            _ = abort => Err(MigrateError::Aborted),
        }
    }
}
