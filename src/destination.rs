// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination-side receiver choreography.
//!
//! The receiver attaches disks, creates the proto-domain and reserves its
//! memory before signalling readiness at barrier [1]; it then consumes the
//! memory image, waits for the source's hand-over at barrier [3], activates
//! disks (and restores devices, if the SR's activate capability forced the
//! delay), adopts the VM record and confirms at barrier [4].
//!
//! Until adoption the proto-domain is invisible to event-thread cleanup,
//! so every failure path here destroys it, deactivates whatever this side
//! activated, and detaches all needed VDIs unconditionally (detaching a
//! never-attached VDI is a storage-level no-op). A best-effort Error frame
//! tells the source why; it never masks the original error.

use slog::{error, info, o, warn, Logger};

use crate::codec::{ByteStream, Handshake, Message};
use crate::db::{
    AccessMode, BootRecord, VdiRef, VifRef, VmRecord, VmRef,
};
use crate::failure_injection::{self, FaultPoint};
use crate::hypervisor::{DestroyOpts, DomainId, ShutdownReason};
use crate::ledger::DestinationLedger;
use crate::{ClusterError, MigrateContext, MigrateError, MigrateRole};

/// Runs the receiver over an admitted stream from the source.
///
/// `vm` is the reference named by the sender; the receiver remaps it
/// through the peer lookup before touching anything.
pub async fn receive<T: ByteStream>(
    ctx: &MigrateContext,
    vm: VmRef,
    is_localhost: bool,
    memory_required_kib: u64,
    stream: T,
) -> Result<(), MigrateError> {
    let log = ctx
        .log
        .new(o!("migrate_role" => "destination", "vm" => vm.to_string()));
    info!(log, "entering destination migration task");

    let mut proto = DestinationProtocol {
        ctx,
        log: log.clone(),
        vm,
        is_localhost,
        memory_required_kib,
        chan: Handshake::new(stream, MigrateRole::Source),
        ledger: DestinationLedger::default(),
        needed: Vec::new(),
        vifs: Vec::new(),
        delay_device_create: false,
        adopted: false,
    };

    match proto.run().await {
        Ok(()) => {
            info!(log, "destination migration successful");
            Ok(())
        }
        Err(err) => {
            error!(log, "destination migration failed"; "error" => %err);
            if !proto.adopted {
                // Best effort; must not mask the original error.
                let _ = proto
                    .chan
                    .send(Message::Error(err.to_string()))
                    .await;
                proto.fail_cleanup().await;
            }
            Err(err)
        }
    }
}

struct DestinationPlan {
    record: VmRecord,
    boot: BootRecord,
}

struct DestinationProtocol<'a, T> {
    ctx: &'a MigrateContext,
    log: Logger,
    vm: VmRef,
    is_localhost: bool,
    memory_required_kib: u64,
    chan: Handshake<T>,
    ledger: DestinationLedger,
    /// The VDIs the guest needs on resume, with their access mode.
    needed: Vec<(VdiRef, AccessMode)>,
    vifs: Vec<VifRef>,
    delay_device_create: bool,
    /// Set once `resident_on` names this host: the domain is no longer a
    /// proto-domain and failure paths must not unwind it.
    adopted: bool,
}

impl<'a, T: ByteStream> DestinationProtocol<'a, T> {
    async fn run(&mut self) -> Result<(), MigrateError> {
        let plan = self.prepare().await?;
        self.attach_disks().await?;
        self.create_proto_domain(&plan).await?;
        self.restore_image(&plan).await?;
        self.await_hand_over().await?;
        self.activate_disks(&plan).await?;
        self.adopt().await?;

        // Barrier [4]: tell the source the adoption is complete.
        self.chan
            .send(Message::Success)
            .await
            .map_err(MigrateError::from)?;
        Ok(())
    }

    async fn prepare(&mut self) -> Result<DestinationPlan, MigrateError> {
        // Protected VMs may resume into a distinct record on this side.
        let remapped = self.ctx.db.peer_lookup(&self.vm).await?;
        if remapped != self.vm {
            info!(
                self.log, "peer lookup remapped the destination VM";
                "remapped" => %remapped
            );
            self.vm = remapped;
        }

        let boot = self.ctx.db.boot_record(&self.vm).await?;
        let record = self.ctx.db.vm_record(&self.vm).await?;

        let mut needed: Vec<(VdiRef, AccessMode)> = Vec::new();
        for vbd in &record.vbds {
            let vbd_record = self.ctx.db.vbd_record(vbd).await?;
            if !vbd_record.currently_attached || vbd_record.empty {
                continue;
            }
            let Some(vdi) = vbd_record.vdi else { continue };
            // RW wins when several VBDs share a VDI.
            match needed.iter_mut().find(|(v, _)| *v == vdi) {
                Some((_, mode)) => {
                    if vbd_record.mode == AccessMode::Rw {
                        *mode = AccessMode::Rw;
                    }
                }
                None => needed.push((vdi, vbd_record.mode)),
            }
        }
        self.needed = needed;

        info!(
            self.log, "receiver ready to attach";
            "vdis" => self.needed.len(),
            "memory_required_kib" => self.memory_required_kib
        );
        Ok(DestinationPlan { record, boot })
    }

    /// Attempts every attach, collecting outcomes; the first failure is
    /// the one reported to the source at barrier [1].
    async fn attach_disks(&mut self) -> Result<(), MigrateError> {
        let mut first_failure = None;
        for (vdi, mode) in &self.needed {
            match self.ctx.storage.attach(vdi, *mode).await {
                Ok(()) => self.ledger.attached_vdis.push(*vdi),
                Err(e) => {
                    error!(
                        self.log, "failed to attach VDI";
                        "vdi" => %vdi, "error" => %e
                    );
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_failure {
            return Err(e.into());
        }

        let mut delay = false;
        for (vdi, _) in &self.needed {
            if self.ctx.storage.sr_has_activate_capability(vdi).await? {
                delay = true;
                break;
            }
        }
        self.delay_device_create = delay;
        Ok(())
    }

    /// Creates and provisions the proto-domain, ending with barrier [1].
    async fn create_proto_domain(
        &mut self,
        plan: &DestinationPlan,
    ) -> Result<(), MigrateError> {
        let domid =
            self.ctx.hypervisor.create_domain(&self.vm, &plan.boot).await?;
        self.ledger.created_domid = Some(domid);

        self.vifs = self.ctx.db.vifs_of(&self.vm).await?;
        self.ctx
            .hypervisor
            .reserve_memory(domid, self.memory_required_kib)
            .await?;

        if !self.delay_device_create {
            self.ctx
                .hypervisor
                .restore_devices(&self.vm, domid, &plan.record.vbds, &self.vifs)
                .await?;
        }

        failure_injection::fail_if_armed(
            &self.log,
            &plan.record,
            FaultPoint::BeforeRestore,
        )?;

        // Barrier [1]: the source may now suspend and stream.
        self.chan
            .send(Message::Success)
            .await
            .map_err(MigrateError::from)?;
        info!(
            self.log, "proto-domain ready";
            "domid" => %domid, "delayed_devices" => self.delay_device_create
        );
        Ok(())
    }

    /// Consumes the memory image; its completion is barrier [2].
    async fn restore_image(
        &mut self,
        plan: &DestinationPlan,
    ) -> Result<(), MigrateError> {
        let domid = self.domid()?;
        self.ctx.hypervisor.restore(domid, self.chan.inner_mut()).await?;
        info!(self.log, "memory image restored"; "domid" => %domid);

        if failure_injection::armed(&plan.record, FaultPoint::CrashAfterRestore)
        {
            // Simulated crash; the protocol carries on and unpause trips.
            warn!(self.log, "failure injection: crashing restored domain");
            if let Err(e) = self
                .ctx
                .hypervisor
                .shutdown_domain(domid, ShutdownReason::Crashed)
                .await
            {
                warn!(
                    self.log, "failed to inject crash"; "error" => %e
                );
            }
        }
        Ok(())
    }

    /// Barrier [3]: the source has flushed, deactivated and detached.
    async fn await_hand_over(&mut self) -> Result<(), MigrateError> {
        self.chan.recv_success().await?;
        info!(self.log, "source released ownership");
        Ok(())
    }

    async fn activate_disks(
        &mut self,
        plan: &DestinationPlan,
    ) -> Result<(), MigrateError> {
        let domid = self.domid()?;
        if !self.is_localhost {
            for (vdi, _) in &self.needed {
                self.ctx.storage.activate(vdi).await?;
                self.ledger.activated_vdis.push(*vdi);
            }
        }
        if self.delay_device_create {
            self.ctx
                .hypervisor
                .restore_devices(&self.vm, domid, &plan.record.vbds, &self.vifs)
                .await?;
        }
        Ok(())
    }

    async fn adopt(&mut self) -> Result<(), MigrateError> {
        let domid = self.domid()?;
        self.ctx.hypervisor.unpause(domid).await?;
        self.ctx.hypervisor.pci_plug(&self.vm, domid).await?;

        self.ctx.db.set_domid(&self.vm, Some(domid)).await?;
        let here = self.ctx.db.local_host();
        self.ctx.db.set_resident_on(&self.vm, &here).await?;
        // The resident_on flip is the logical completion of the
        // migration; nothing after it may unwind the domain.
        self.adopted = true;

        if let Err(e) = self.ctx.db.update_peer_state(&self.vm).await {
            warn!(self.log, "failed to update peer state"; "error" => %e);
        }
        if let Err(e) = self.ctx.hypervisor.balance_memory().await {
            warn!(self.log, "failed to rebalance host memory"; "error" => %e);
        }
        self.ctx.events.progress(&self.ctx.task, 1.0).await;
        info!(self.log, "VM adopted"; "domid" => %domid);
        Ok(())
    }

    fn domid(&self) -> Result<DomainId, MigrateError> {
        self.ledger.created_domid.ok_or_else(|| {
            MigrateError::Cluster(ClusterError::InternalError(
                "no proto-domain on record".to_string(),
            ))
        })
    }

    /// Failure-path cleanup. Every step is best-effort: deactivate what
    /// this side activated, destroy the proto-domain, then detach-all.
    async fn fail_cleanup(&mut self) {
        if !self.is_localhost {
            for vdi in std::mem::take(&mut self.ledger.activated_vdis) {
                if let Err(e) = self.ctx.storage.deactivate(&vdi).await {
                    warn!(
                        self.log, "cleanup: failed to deactivate VDI";
                        "vdi" => %vdi, "error" => %e
                    );
                }
            }
        }

        if let Some(domid) = self.ledger.created_domid.take() {
            let opts = DestroyOpts {
                preserve_xenstore: false,
                detach_devices: !self.is_localhost,
                deactivate_devices: false,
            };
            if let Err(e) =
                self.ctx.hypervisor.destroy_domain(domid, opts).await
            {
                warn!(
                    self.log, "cleanup: failed to destroy proto-domain";
                    "domid" => %domid, "error" => %e
                );
            }
        }

        // Unconditional over the needed set, not just what attached.
        for (vdi, _) in self.needed.clone() {
            if let Err(e) = self.ctx.storage.detach(&vdi).await {
                warn!(
                    self.log, "cleanup: failed to detach VDI";
                    "vdi" => %vdi, "error" => %e
                );
            }
        }
        self.ledger.attached_vdis.clear();
    }
}
