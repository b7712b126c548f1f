// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level migration entry points on the source host.
//!
//! `pool_migrate` owns the whole attempt: admission under the VM's cluster
//! lock, the trivial affinity-only path for non-running VMs, transport
//! bring-up (TCP + HTTP CONNECT carrying the session credential once), the
//! hand-off to the transmitter and the terminal task status. The secure
//! RPC session and the socket are released in nested guaranteed-release
//! blocks.

use std::collections::BTreeMap;
use std::time::Duration;

use slog::{error, info, o, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::config;
use crate::db::{HostRef, PowerState, SessionId, VbdRef, VmRecord, VmRef};
use crate::events::TaskStatus;
use crate::hypervisor::DomainId;
use crate::source;
use crate::{ClusterError, MigrateContext, MigrateError};

/// URI the destination serves migrations on.
pub const MIGRATE_URI: &str = "/migrate";

/// How many times the admission gate re-polls a paused VBD, and how long
/// it sleeps between polls.
const VBD_PAUSE_POLLS: u32 = 5;
const VBD_PAUSE_INTERVAL: Duration = Duration::from_secs(5);

/// Migrates `vm` to `destination` within the pool.
///
/// Non-running VMs only have their affinity updated. The task always
/// receives a terminal status: success, cancelled or failure.
pub async fn pool_migrate(
    ctx: &MigrateContext,
    vm: VmRef,
    destination: HostRef,
    options: &BTreeMap<String, String>,
) -> Result<(), ClusterError> {
    ctx.events.task_status(&ctx.task, TaskStatus::Pending).await;
    let res = pool_migrate_inner(ctx, vm, destination, options).await;
    let status = match &res {
        Ok(()) => TaskStatus::Success,
        Err(ClusterError::TaskCancelled) => TaskStatus::Cancelled,
        Err(e) => TaskStatus::Failure(e.clone()),
    };
    ctx.events.task_status(&ctx.task, status).await;
    res
}

/// Cross-pool migration entry point.
pub async fn migrate(
    _ctx: &MigrateContext,
    _vm: VmRef,
    _options: &BTreeMap<String, String>,
) -> Result<(), ClusterError> {
    Err(ClusterError::NotImplemented("VM.migrate".to_string()))
}

async fn pool_migrate_inner(
    ctx: &MigrateContext,
    vm: VmRef,
    destination: HostRef,
    options: &BTreeMap<String, String>,
) -> Result<(), ClusterError> {
    let log = ctx.log.new(o!(
        "vm" => vm.to_string(),
        "destination" => destination.to_string()
    ));

    ctx.db.acquire_vm_lock(&vm).await?;
    let res = migrate_locked(ctx, &log, vm, destination, options).await;
    ctx.db.release_vm_lock(&vm).await;
    res
}

async fn migrate_locked(
    ctx: &MigrateContext,
    log: &Logger,
    vm: VmRef,
    destination: HostRef,
    options: &BTreeMap<String, String>,
) -> Result<(), ClusterError> {
    let record = ctx.db.vm_record(&vm).await?;

    // Admission: cheap checks only, the lock is held throughout.
    no_paused_vbds_gate(ctx, log, &record).await?;
    if ctx.events.task_cancelled(&ctx.task).await {
        return Err(ClusterError::TaskCancelled);
    }
    if ctx.liaison.abort_requested() {
        return Err(migrate_failed(
            &record,
            &destination,
            &MigrateError::Aborted.to_string(),
        ));
    }

    if !ctx.db.host_enabled(&destination).await? {
        return Err(ClusterError::HostDisabled(vm.to_string()));
    }

    let src_flags = ctx.db.host_cpu_flags(&record.resident_on).await?;
    let dst_flags = ctx.db.host_cpu_flags(&destination).await?;
    if src_flags != dst_flags {
        warn!(
            log,
            "CPU flags differ between source and destination; continuing"
        );
    }

    match record.power_state {
        PowerState::Halted | PowerState::Suspended => {
            info!(log, "VM is not running; updating affinity only");
            ctx.db.set_affinity(&vm, &destination).await?;
            Ok(())
        }
        PowerState::Running => {
            live_migrate(ctx, log, vm, &record, destination, options).await
        }
        other => Err(ClusterError::InternalError(format!(
            "cannot migrate VM in power state {:?}",
            other
        ))),
    }
}

async fn live_migrate(
    ctx: &MigrateContext,
    log: &Logger,
    vm: VmRef,
    record: &VmRecord,
    destination: HostRef,
    options: &BTreeMap<String, String>,
) -> Result<(), ClusterError> {
    ctx.events.pre_migrate_hook(&vm).await?;

    let is_live = config::live_requested(options);
    let is_localhost = destination == ctx.db.local_host();

    let addr = ctx.db.host_address(&destination).await?;
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|_| ClusterError::HostOffline(destination.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!(log, "failed to set TCP_NODELAY"; "error" => %e);
    }
    info!(log, "connected to destination"; "address" => &addr);

    // The session outlives the protocol run and is released whatever
    // happens; the socket itself closes when `stream` drops below.
    let session = ctx.db.session_for_host(&destination).await?;
    let res = connect_and_transmit(
        ctx,
        log,
        vm,
        record,
        destination,
        &session,
        is_live,
        is_localhost,
        stream,
    )
    .await;
    ctx.db.release_session(&session).await;
    res
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_transmit(
    ctx: &MigrateContext,
    log: &Logger,
    vm: VmRef,
    record: &VmRecord,
    destination: HostRef,
    session: &SessionId,
    is_live: bool,
    is_localhost: bool,
    mut stream: TcpStream,
) -> Result<(), ClusterError> {
    // HTTP CONNECT upgrade; the session credential crosses the cleartext
    // stream exactly once, here.
    let request = format!(
        "CONNECT {}?ref={} HTTP/1.0\r\nCookie: session_id={}; task_id={}\r\n\r\n",
        MIGRATE_URI, vm, session, ctx.task
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|_| ClusterError::HostOffline(destination.to_string()))?;

    let status = read_http_status(&mut stream)
        .await
        .map_err(|_| ClusterError::HostOffline(destination.to_string()))?;
    if status != 200 {
        error!(log, "destination refused the migration"; "status" => status);
        // The destination records structured errors against our task.
        if let Some(e) = ctx.events.remote_task_error(session, &ctx.task).await
        {
            return Err(e);
        }
        return Err(ClusterError::InternalError(format!(
            "destination returned HTTP {}",
            status
        )));
    }

    match source::transmit(
        ctx,
        vm,
        destination,
        *session,
        is_live,
        is_localhost,
        stream,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(MigrateError::Cluster(e)) => Err(e),
        Err(e) => Err(migrate_failed(record, &destination, &e.to_string())),
    }
}

fn migrate_failed(
    record: &VmRecord,
    destination: &HostRef,
    message: &str,
) -> ClusterError {
    ClusterError::VmMigrateFailed {
        vm: record.name_label.clone(),
        source_host: record.resident_on.to_string(),
        destination: destination.to_string(),
        message: message.to_string(),
    }
}

/// Refuses to start while any attached, non-empty VBD is paused in the
/// hypervisor. One immediate check, then up to `VBD_PAUSE_POLLS` re-polls
/// spaced `VBD_PAUSE_INTERVAL` apart.
async fn no_paused_vbds_gate(
    ctx: &MigrateContext,
    log: &Logger,
    record: &VmRecord,
) -> Result<(), ClusterError> {
    let Some(domid) = record.domid else {
        // Nothing is attached in the hypervisor for a non-running VM.
        return Ok(());
    };

    let mut paused = match first_paused_vbd(ctx, domid, record).await? {
        None => return Ok(()),
        Some(vbd) => vbd,
    };
    for attempt in 1..=VBD_PAUSE_POLLS {
        info!(
            log, "waiting for paused VBD";
            "vbd" => %paused, "attempt" => attempt
        );
        sleep(VBD_PAUSE_INTERVAL).await;
        match first_paused_vbd(ctx, domid, record).await? {
            None => return Ok(()),
            Some(vbd) => paused = vbd,
        }
    }
    Err(ClusterError::OtherOperationInProgress {
        class: "VBD".to_string(),
        object: paused.to_string(),
    })
}

async fn first_paused_vbd(
    ctx: &MigrateContext,
    domid: DomainId,
    record: &VmRecord,
) -> Result<Option<VbdRef>, ClusterError> {
    for vbd in &record.vbds {
        let vbd_record = ctx.db.vbd_record(vbd).await?;
        if !vbd_record.currently_attached || vbd_record.empty {
            continue;
        }
        let paused = ctx
            .hypervisor
            .vbd_paused(domid, vbd)
            .await
            .map_err(|e| ClusterError::InternalError(e.to_string()))?;
        if paused {
            return Ok(Some(*vbd));
        }
    }
    Ok(None)
}

async fn read_http_status(
    stream: &mut TcpStream,
) -> Result<u16, std::io::Error> {
    let head = read_until_blank_line(stream).await?;
    head.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed HTTP status line",
            )
        })
}

/// Reads an HTTP head (request or response) up to the blank line. Exact
/// reads only: nothing past the head is consumed off the stream.
pub(crate) async fn read_until_blank_line<S>(
    stream: &mut S,
) -> Result<String, std::io::Error>
where
    S: tokio::io::AsyncRead + Unpin,
{
    const MAX_HEAD: usize = 8192;
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "HTTP head too large",
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "non-UTF8 HTTP head",
        )
    })
}
