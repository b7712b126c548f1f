// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `other_config` knobs the engine consumes, and the parsing rules for
//! each. Malformed values never fail a migration; they fall back to the
//! default with a logged warning.

use std::collections::BTreeMap;

use slog::{warn, Logger};

use crate::db::VmRecord;

/// Arms a deterministic failure injection point (value "1".."5").
pub const MIGRATION_FAILURE_TEST: &str = "migration_failure_test_key";

/// Comma-separated extra xenstore paths to watch during VBD hard-shutdown.
pub const MIGRATION_EXTRA_PATHS: &str = "migration_extra_paths_key";

/// Save progress fraction at which PCI hot-unplug begins.
pub const PCI_HOTUNPLUG_TIME: &str = "pci-hotunplug-time";

pub const DEFAULT_PCI_HOTUNPLUG_TIME: f64 = 0.8;

pub fn failure_test_point(record: &VmRecord) -> Option<u8> {
    record.other_config.get(MIGRATION_FAILURE_TEST)?.trim().parse().ok()
}

pub fn extra_debug_paths(record: &VmRecord) -> Vec<String> {
    match record.other_config.get(MIGRATION_EXTRA_PATHS) {
        Some(paths) => paths
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect(),
        None => Vec::new(),
    }
}

pub fn pci_hotunplug_time(log: &Logger, record: &VmRecord) -> f64 {
    let Some(raw) = record.other_config.get(PCI_HOTUNPLUG_TIME) else {
        return DEFAULT_PCI_HOTUNPLUG_TIME;
    };
    match raw.trim().parse::<f64>() {
        Ok(t) if (0.0..=1.0).contains(&t) => t,
        _ => {
            warn!(
                log, "ignoring unparseable {} value", PCI_HOTUNPLUG_TIME;
                "value" => raw.clone()
            );
            DEFAULT_PCI_HOTUNPLUG_TIME
        }
    }
}

/// Whether the caller asked for live (iterative pre-copy) migration.
pub fn live_requested(options: &BTreeMap<String, String>) -> bool {
    options
        .get("live")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
