// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination-side admission of an incoming migration stream.
//!
//! Parses the HTTP CONNECT head off the accepted socket, refuses requests
//! without credentials, takes the destination VM's cluster lock (unless
//! the sender already holds it: localhost migration of the same record),
//! sizes the memory reservation and hands the upgraded stream to the
//! receiver.

use slog::{error, info, o, Logger};
use tokio::io::AsyncWriteExt;

use crate::codec::ByteStream;
use crate::coordinator::{read_until_blank_line, MIGRATE_URI};
use crate::db::{SessionId, TaskId, VmRef};
use crate::destination;
use crate::events::TaskStatus;
use crate::{ClusterError, MigrateContext, MigrateError};

/// Credentials and target parsed from an incoming request.
#[derive(Debug, Eq, PartialEq)]
struct AdmissionRequest {
    vm: VmRef,
    session_id: SessionId,
    task_id: TaskId,
}

/// Serves one incoming migration connection end to end. The error is also
/// recorded against the sender's task so the source can retrieve it.
pub async fn handle_incoming<T: ByteStream>(
    ctx: &MigrateContext,
    mut stream: T,
) -> Result<(), ClusterError> {
    let head = read_until_blank_line(&mut stream)
        .await
        .map_err(|e| ClusterError::InternalError(e.to_string()))?;

    let Some(request) = parse_request(&head) else {
        let _ = stream.write_all(b"HTTP/1.0 403 Forbidden\r\n\r\n").await;
        return Err(ClusterError::InternalError(
            "refused migration request without credentials".to_string(),
        ));
    };

    // The admitted request runs under the task named in its cookie.
    let ctx = MigrateContext {
        task: request.task_id,
        log: ctx.log.new(o!("task" => request.task_id.to_string())),
        ..ctx.clone()
    };

    let res = admit(&ctx, &ctx.log, request, stream).await;
    if let Err(ref e) = res {
        error!(ctx.log, "incoming migration failed"; "error" => %e);
        ctx.events
            .task_status(&ctx.task, TaskStatus::Failure(e.clone()))
            .await;
    }
    res
}

async fn admit<T: ByteStream>(
    ctx: &MigrateContext,
    log: &Logger,
    request: AdmissionRequest,
    stream: T,
) -> Result<(), ClusterError> {
    let dest_vm = ctx.db.peer_lookup(&request.vm).await?;
    let dest_record = ctx.db.vm_record(&dest_vm).await?;
    let here = ctx.db.local_host();
    let is_localhost = dest_record.resident_on == here;

    // For a localhost migration of the same record the sender already
    // holds the lock.
    let take_lock = !(is_localhost && dest_vm == request.vm);
    if take_lock {
        ctx.db.acquire_vm_lock(&dest_vm).await?;
    }
    let res =
        run_receiver(ctx, log, &request, &dest_vm, is_localhost, stream).await;
    if take_lock {
        ctx.db.release_vm_lock(&dest_vm).await;
    }
    res
}

async fn run_receiver<T: ByteStream>(
    ctx: &MigrateContext,
    log: &Logger,
    request: &AdmissionRequest,
    dest_vm: &VmRef,
    is_localhost: bool,
    mut stream: T,
) -> Result<(), ClusterError> {
    let boot = ctx.db.boot_record(dest_vm).await?;
    let memory_required_kib = ctx
        .hypervisor
        .memory_required_kib(&boot)
        .await
        .map_err(|e| ClusterError::InternalError(e.to_string()))?;

    stream
        .write_all(b"HTTP/1.0 200 OK\r\n\r\n")
        .await
        .map_err(|e| ClusterError::InternalError(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| ClusterError::InternalError(e.to_string()))?;
    info!(
        log, "admitted migration";
        "vm" => %request.vm, "session" => %request.session_id,
        "localhost" => is_localhost,
        "memory_required_kib" => memory_required_kib
    );

    match destination::receive(
        ctx,
        request.vm,
        is_localhost,
        memory_required_kib,
        stream,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(MigrateError::Cluster(e)) => Err(e),
        Err(e) => Err(ClusterError::InternalError(e.to_string())),
    }
}

/// Extracts the VM reference and credential cookies; `None` refuses the
/// request.
fn parse_request(head: &str) -> Option<AdmissionRequest> {
    let request_line = head.lines().next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;

    let (path, query) = target.split_once('?')?;
    if path != MIGRATE_URI {
        return None;
    }
    let vm = query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "ref").then_some(v)
    })?;

    let cookies = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("cookie").then(|| value.trim())
    })?;
    let mut session_id = None;
    let mut task_id = None;
    for cookie in cookies.split(';') {
        let Some((k, v)) = cookie.trim().split_once('=') else {
            continue;
        };
        match k {
            "session_id" => session_id = Some(v),
            "task_id" => task_id = Some(v),
            _ => {}
        }
    }

    Some(AdmissionRequest {
        vm: vm.parse().ok()?,
        session_id: session_id?.parse().ok()?,
        task_id: task_id?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_for(vm: &VmRef, session: &SessionId, task: &TaskId) -> String {
        format!(
            "CONNECT /migrate?ref={} HTTP/1.0\r\n\
             Cookie: session_id={}; task_id={}\r\n\r\n",
            vm, session, task
        )
    }

    #[test]
    fn well_formed_request_parses() {
        let vm = VmRef::generate();
        let session = SessionId::generate();
        let task = TaskId::generate();
        let parsed = parse_request(&head_for(&vm, &session, &task)).unwrap();
        assert_eq!(
            parsed,
            AdmissionRequest { vm, session_id: session, task_id: task }
        );
    }

    #[test]
    fn missing_credentials_are_refused() {
        let vm = VmRef::generate();
        let head = format!(
            "CONNECT /migrate?ref={} HTTP/1.0\r\n\
             Cookie: task_id={}\r\n\r\n",
            vm,
            TaskId::generate()
        );
        assert!(parse_request(&head).is_none());
    }

    #[test]
    fn missing_ref_is_refused() {
        let head = format!(
            "CONNECT /migrate?other=1 HTTP/1.0\r\n\
             Cookie: session_id={}; task_id={}\r\n\r\n",
            SessionId::generate(),
            TaskId::generate()
        );
        assert!(parse_request(&head).is_none());
    }

    #[test]
    fn wrong_path_is_refused() {
        let head = format!(
            "CONNECT /elsewhere?ref={} HTTP/1.0\r\n\
             Cookie: session_id={}; task_id={}\r\n\r\n",
            VmRef::generate(),
            SessionId::generate(),
            TaskId::generate()
        );
        assert!(parse_request(&head).is_none());
    }

    #[test]
    fn garbage_uuid_is_refused() {
        let head = "CONNECT /migrate?ref=not-a-uuid HTTP/1.0\r\n\
                    Cookie: session_id=also-not; task_id=nope\r\n\r\n";
        assert!(parse_request(head).is_none());
    }
}
