// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The abort and suspend-acknowledgement liaison.
//!
//! Aborts are polled, not pushed: the transmitter checks before waiting
//! on the guest's suspend acknowledgement and on every progress report
//! from the save routine.

use async_trait::async_trait;

use crate::db::VmRef;

#[async_trait]
pub trait MigrationLiaison: Send + Sync {
    /// Whether an external abort of this migration is pending.
    fn abort_requested(&self) -> bool;

    /// Tells the liaison the guest is entering full suspend.
    async fn notify_entering_suspend(&self, vm: &VmRef);

    /// Resolves once the guest acknowledges the suspend request. The
    /// caller bounds the wait.
    async fn await_suspend_ack(&self, vm: &VmRef);
}
