// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic migration faults, armed through a VM's `other_config`.
//! Each point either fails the migration outright or (for the crash
//! points) drives the hypervisor into the state under test.

use slog::{info, Logger};

use crate::config;
use crate::db::VmRecord;
use crate::MigrateError;

/// The five points at which a fault can be injected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultPoint {
    /// Source, before the guest is suspended.
    BeforeSuspend,
    /// Source, forces a domain crash while suspending.
    CrashDuringSuspend,
    /// Source, after suspend but before the disk flush.
    BeforeFlush,
    /// Destination, before the memory image is restored.
    BeforeRestore,
    /// Destination, simulates a crash after restore; the protocol carries
    /// on and trips over the crash at unpause.
    CrashAfterRestore,
}

impl FaultPoint {
    pub fn number(self) -> u8 {
        match self {
            FaultPoint::BeforeSuspend => 1,
            FaultPoint::CrashDuringSuspend => 2,
            FaultPoint::BeforeFlush => 3,
            FaultPoint::BeforeRestore => 4,
            FaultPoint::CrashAfterRestore => 5,
        }
    }
}

/// True when `record` arms the given point.
pub fn armed(record: &VmRecord, point: FaultPoint) -> bool {
    config::failure_test_point(record) == Some(point.number())
}

/// Fails with the injected fault when `record` arms `point`.
pub fn fail_if_armed(
    log: &Logger,
    record: &VmRecord,
    point: FaultPoint,
) -> Result<(), MigrateError> {
    if armed(record, point) {
        info!(log, "failure injection triggered"; "point" => point.number());
        return Err(MigrateError::FailureTest(point.number()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{HostRef, PowerState, VmRef};

    #[test]
    fn only_the_armed_point_fires() {
        let mut record = VmRecord {
            vm: VmRef::generate(),
            name_label: "t".to_string(),
            power_state: PowerState::Running,
            resident_on: HostRef::generate(),
            domid: None,
            vbds: Vec::new(),
            other_config: Default::default(),
        };
        record.other_config.insert(
            config::MIGRATION_FAILURE_TEST.to_string(),
            "3".to_string(),
        );
        assert!(!armed(&record, FaultPoint::BeforeSuspend));
        assert!(armed(&record, FaultPoint::BeforeFlush));

        let log = Logger::root(slog::Discard, slog::o!());
        assert!(fail_if_armed(&log, &record, FaultPoint::BeforeSuspend).is_ok());
        match fail_if_armed(&log, &record, FaultPoint::BeforeFlush) {
            Err(MigrateError::FailureTest(3)) => {}
            other => panic!("expected failure test error, got {other:?}"),
        }
    }
}
