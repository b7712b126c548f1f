// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end migration scenarios: the coordinator and transmitter on one
//! simulated host, the admission handler and receiver on another, talking
//! over a real loopback socket.

use std::collections::BTreeMap;

use slog::Logger;
use tokio::net::TcpListener;

use vmlift::admission;
use vmlift::config;
use vmlift::coordinator;
use vmlift::db::{HostRef, PowerState, TaskId, VmRef};
use vmlift::events::TaskStatus;
use vmlift::hypervisor::PciDevice;
use vmlift::sim::SimWorld;
use vmlift::ClusterError;

fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn live_options() -> BTreeMap<String, String> {
    BTreeMap::from([("live".to_string(), "true".to_string())])
}

/// Runs a full migration of `vm` from `src` to `dst`, returning the
/// coordinator's and the admission handler's results.
async fn run_migration(
    world: &SimWorld,
    src: HostRef,
    dst: HostRef,
    vm: VmRef,
    task: TaskId,
) -> (Result<(), ClusterError>, Result<(), ClusterError>) {
    let log = test_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    world.set_host_address(dst, listener.local_addr().unwrap().to_string());

    let dst_ctx = world.context(dst, TaskId::generate(), &log);
    let accept = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        admission::handle_incoming(&dst_ctx, socket).await
    });

    let src_ctx = world.context(src, task, &log);
    let res =
        coordinator::pool_migrate(&src_ctx, vm, dst, &live_options()).await;
    let dst_res = accept.await.unwrap();
    (res, dst_res)
}

#[tokio::test]
async fn live_migration_moves_a_running_vm() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let image = b"guest memory image".to_vec();
    let vm = world.add_running_vm(src, 2, image.clone());
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    assert!(res.is_ok(), "{res:?}");
    assert!(dst_res.is_ok(), "{dst_res:?}");

    // The record moved and references the new domain.
    let record = world.vm_record(vm);
    assert_eq!(record.resident_on, dst);
    assert_eq!(record.power_state, PowerState::Running);
    let (domid, domain) = world.hypervisor(dst).domain_of_vm(vm).unwrap();
    assert_eq!(record.domid, Some(domid));

    // The memory image arrived end to end and the guest is running.
    assert_eq!(domain.memory, image);
    assert!(!domain.paused);
    assert!(domain.devices_restored);
    assert_eq!(domain.reserved_kib, 1 << 20);

    // The source flushed its disks and destroyed the old domain.
    assert_eq!(world.hypervisor(src).flushed_domains().len(), 1);
    assert_eq!(world.hypervisor(src).live_domain_count(), 0);
    assert_eq!(world.hypervisor(src).destroyed_domains().len(), 1);

    // Disks: detached on the source, attached on the destination.
    for vdi in world.vdis_of(vm) {
        assert_eq!(world.vdi_state(src, vdi), (0, false));
        assert_eq!(world.vdi_state(dst, vdi).0, 1);
    }
    assert!(!world.double_activation());

    // Progress climbed monotonically to 1.0.
    let progress = world.events.progress_for(&task);
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last().copied(), Some(1.0));

    // Task history: pending first, success last; hook and RRD push ran.
    let statuses = world.events.statuses_for(&task);
    assert_eq!(statuses.first(), Some(&TaskStatus::Pending));
    assert_eq!(statuses.last(), Some(&TaskStatus::Success));
    assert_eq!(world.events.hooks_run(), vec![vm]);
    assert_eq!(world.events.rrd_pushes(), vec![(vm, dst)]);

    // Both sides locked the record; the RPC session was released; the
    // guest was told it was entering suspend; adoption plugged PCI and
    // rebalanced memory on the destination.
    assert_eq!(world.locks_taken(), vec![vm, vm]);
    assert_eq!(world.session_counts(), (1, 1));
    assert!(world.liaison(src).was_notified());
    assert_eq!(world.hypervisor(dst).plugged_domains(), vec![domid]);
    assert_eq!(world.hypervisor(dst).memory_balance_count(), 1);
}

#[tokio::test]
async fn activate_capable_sr_hands_activation_across() {
    let mut world = SimWorld::new();
    world.set_activate_capability();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    assert!(res.is_ok(), "{res:?}");
    assert!(dst_res.is_ok(), "{dst_res:?}");

    // Activation moved to the destination and was never held twice.
    for vdi in world.vdis_of(vm) {
        assert_eq!(world.vdi_state(src, vdi), (0, false));
        assert_eq!(world.vdi_state(dst, vdi), (1, true));
    }
    assert!(!world.double_activation());

    // Device restore was delayed until after activation and still ran.
    let (_, domain) = world.hypervisor(dst).domain_of_vm(vm).unwrap();
    assert!(domain.devices_restored);
    assert!(!domain.paused);
}

#[tokio::test]
async fn localhost_migration_keeps_storage_attached() {
    let mut world = SimWorld::new();
    let host = world.add_host();
    let vm = world.add_running_vm(host, 1, b"image".to_vec());
    let old_domid = world.vm_record(vm).domid.unwrap();
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, host, host, vm, task).await;
    assert!(res.is_ok(), "{res:?}");
    assert!(dst_res.is_ok(), "{dst_res:?}");

    let record = world.vm_record(vm);
    assert_eq!(record.resident_on, host);
    assert_ne!(record.domid, Some(old_domid));

    // The old domain went away, the adopted one survives.
    assert_eq!(world.hypervisor(host).live_domain_count(), 1);
    assert_eq!(world.hypervisor(host).destroyed_domains(), vec![old_domid]);

    // The destination's attach reference survives the source's detach.
    for vdi in world.vdis_of(vm) {
        assert_eq!(world.vdi_state(host, vdi).0, 1);
    }
}

#[tokio::test]
async fn halted_vm_only_moves_affinity() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    // No listener and no address: any connection attempt would fail.
    let vm = world.add_halted_vm(src);
    let task = TaskId::generate();
    let ctx = world.context(src, task, &test_logger());

    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    assert!(res.is_ok(), "{res:?}");

    assert_eq!(world.affinity_of(vm), Some(dst));
    let record = world.vm_record(vm);
    assert_eq!(record.power_state, PowerState::Halted);
    assert_eq!(record.resident_on, src);
    assert_eq!(
        world.events.statuses_for(&task).last(),
        Some(&TaskStatus::Success)
    );
}

#[tokio::test]
async fn receiver_attach_failure_reaches_the_source() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 2, b"image".to_vec());
    let vdis = world.vdis_of(vm);
    world.fail_attach(vdis[0]);
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    match res {
        Err(ClusterError::VmMigrateFailed { message, .. }) => {
            assert!(message.contains("backend refused attach"), "{message}");
        }
        other => panic!("expected VmMigrateFailed, got {other:?}"),
    }
    assert!(dst_res.is_err());

    // No domain was ever created on the destination.
    assert_eq!(world.hypervisor(dst).live_domain_count(), 0);
    assert!(world.hypervisor(dst).destroyed_domains().is_empty());

    // The destination rolled back the attach that did succeed.
    assert_eq!(world.vdi_state(dst, vdis[1]).0, 0);

    // The source is untouched: still resident, running, attached.
    let record = world.vm_record(vm);
    assert_eq!(record.resident_on, src);
    assert_eq!(record.power_state, PowerState::Running);
    assert_eq!(world.hypervisor(src).live_domain_count(), 1);
    assert!(world.hypervisor(src).flushed_domains().is_empty());
    for vdi in &vdis {
        assert_eq!(world.vdi_state(src, *vdi).0, 1);
    }
}

#[tokio::test]
async fn crash_during_suspend_is_classified() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    world.set_other_config(vm, config::MIGRATION_FAILURE_TEST, "2");
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    match &res {
        Err(ClusterError::VmMigrateFailed { message, .. }) => {
            assert_eq!(message, "Domain crashed while suspending");
        }
        other => panic!("expected VmMigrateFailed, got {other:?}"),
    }
    assert!(dst_res.is_err());

    // The destination destroyed its proto-domain.
    assert_eq!(world.hypervisor(dst).live_domain_count(), 0);
    assert_eq!(world.hypervisor(dst).destroyed_domains().len(), 1);

    // No forced Halted on the source: the crashed domain is left to the
    // event thread, and the source release path never ran.
    let record = world.vm_record(vm);
    assert_eq!(record.power_state, PowerState::Running);
    assert_eq!(world.hypervisor(src).live_domain_count(), 1);
    assert!(world.hypervisor(src).destroyed_domains().is_empty());
    let failure = TaskStatus::Failure(res.unwrap_err());
    assert!(world.events.statuses_for(&task).contains(&failure));
}

#[tokio::test]
async fn destination_crash_after_restore_fails_late() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 2, b"image".to_vec());
    world.set_other_config(vm, config::MIGRATION_FAILURE_TEST, "5");
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    match res {
        Err(ClusterError::VmMigrateFailed { message, .. }) => {
            assert!(message.contains("domain has crashed"), "{message}");
        }
        other => panic!("expected VmMigrateFailed, got {other:?}"),
    }
    assert!(dst_res.is_err());

    // The source carried its half through the hand-off before failing,
    // so its record is forced to Halted.
    assert_eq!(world.vm_record(vm).power_state, PowerState::Halted);
    assert_eq!(world.hypervisor(src).flushed_domains().len(), 1);

    // Destination: crashed proto-domain destroyed, detach-all ran.
    assert_eq!(world.hypervisor(dst).live_domain_count(), 0);
    assert_eq!(world.hypervisor(dst).destroyed_domains().len(), 1);
    for vdi in world.vdis_of(vm) {
        assert_eq!(world.vdi_state(dst, vdi).0, 0);
        assert_eq!(world.vdi_state(src, vdi).0, 0);
    }
    assert!(matches!(
        world.events.statuses_for(&task).last(),
        Some(TaskStatus::Failure(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn paused_vbd_gate_gives_up_after_polling() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    let vbd = world.vm_record(vm).vbds[0];
    world.hypervisor(src).pause_vbd(vbd);
    let task = TaskId::generate();
    let ctx = world.context(src, task, &test_logger());

    let start = tokio::time::Instant::now();
    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    let elapsed = start.elapsed();

    match res {
        Err(ClusterError::OtherOperationInProgress { class, object }) => {
            assert_eq!(class, "VBD");
            assert_eq!(object, vbd.to_string());
        }
        other => panic!("expected OtherOperationInProgress, got {other:?}"),
    }
    assert!(
        elapsed >= std::time::Duration::from_secs(25),
        "gave up too early: {elapsed:?}"
    );
    assert!(elapsed < std::time::Duration::from_secs(30));

    // The hypervisor was never touched.
    assert_eq!(world.hypervisor(src).live_domain_count(), 1);
    assert!(world.hypervisor(src).flushed_domains().is_empty());
    assert_eq!(world.hypervisor(dst).live_domain_count(), 0);
}

#[tokio::test]
async fn cancelled_task_ends_cancelled() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    let task = TaskId::generate();
    world.events.cancel_task(task);
    let ctx = world.context(src, task, &test_logger());

    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    assert!(matches!(res, Err(ClusterError::TaskCancelled)), "{res:?}");
    assert_eq!(
        world.events.statuses_for(&task).last(),
        Some(&TaskStatus::Cancelled)
    );

    // Cancellation is a precondition failure: nothing was touched.
    assert_eq!(world.hypervisor(src).live_domain_count(), 1);
    assert!(world.hypervisor(src).flushed_domains().is_empty());
    assert_eq!(world.hypervisor(dst).live_domain_count(), 0);
}

#[tokio::test]
async fn pending_abort_fails_the_preflight() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    world.liaison(src).request_abort();
    let ctx = world.context(src, TaskId::generate(), &test_logger());

    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    match res {
        Err(ClusterError::VmMigrateFailed { message, .. }) => {
            assert!(message.contains("aborted"), "{message}");
        }
        other => panic!("expected VmMigrateFailed, got {other:?}"),
    }
    assert!(world.hypervisor(src).flushed_domains().is_empty());
}

#[tokio::test]
async fn disabled_destination_is_refused() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    world.disable_host(dst);
    let ctx = world.context(src, TaskId::generate(), &test_logger());

    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    assert!(matches!(res, Err(ClusterError::HostDisabled(_))), "{res:?}");
}

#[tokio::test]
async fn unreachable_destination_is_offline() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    // A port nothing listens on.
    world.set_host_address(dst, "127.0.0.1:1".to_string());
    let ctx = world.context(src, TaskId::generate(), &test_logger());

    let res =
        coordinator::pool_migrate(&ctx, vm, dst, &live_options()).await;
    assert!(matches!(res, Err(ClusterError::HostOffline(_))), "{res:?}");
}

#[tokio::test]
async fn cross_pool_migrate_is_not_implemented() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    let ctx = world.context(src, TaskId::generate(), &test_logger());

    let res = coordinator::migrate(&ctx, vm, &BTreeMap::new()).await;
    match res {
        Err(ClusterError::NotImplemented(what)) => {
            assert_eq!(what, "VM.migrate");
        }
        other => panic!("expected NotImplemented, got {other:?}"),
    }
}

#[tokio::test]
async fn pci_hot_unplug_is_one_shot_and_single_device() {
    let mut world = SimWorld::new();
    let src = world.add_host();
    let dst = world.add_host();
    let vm = world.add_running_vm(src, 1, b"image".to_vec());
    let domid = world.vm_record(vm).domid.unwrap();
    world.hypervisor(src).set_pci_devices(
        domid,
        vec![
            PciDevice("0000:01:00.0".to_string()),
            PciDevice("0000:02:00.0".to_string()),
        ],
    );
    let task = TaskId::generate();

    let (res, dst_res) = run_migration(&world, src, dst, vm, task).await;
    assert!(res.is_ok(), "{res:?}");
    assert!(dst_res.is_ok(), "{dst_res:?}");

    // Only the first device is ever unplugged, exactly once.
    assert_eq!(
        world.hypervisor(src).unplugged_pci_devices(),
        vec![PciDevice("0000:01:00.0".to_string())]
    );
}

#[tokio::test]
async fn malformed_admission_request_gets_403() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut world = SimWorld::new();
    let dst = world.add_host();
    let ctx = world.context(dst, TaskId::generate(), &test_logger());

    let (mut client, server) = tokio::io::duplex(1024);
    let handler =
        tokio::spawn(
            async move { admission::handle_incoming(&ctx, server).await },
        );
    client
        .write_all(b"GET /migrate HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut reply = vec![0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.0 403");
    assert!(handler.await.unwrap().is_err());
}
