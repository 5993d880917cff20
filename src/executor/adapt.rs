//! Plan adaptation before a reboot.

use tracing::info;

use crate::plan::{Plan, Step, StepKind, INSTALL_INF_STEP};
use crate::run::{Event, KnowledgeStore};

pub const PRE_REBOOT_NETWORK_RESET: &str = "Pre-reboot network reset";
pub const PRE_REBOOT_DISM: &str = "Pre-reboot DISM repair";
pub const PRE_REBOOT_RESCAN: &str = "Pre-reboot device rescan";

/// Historical failures of driver installs that trigger an early rescan.
const INF_FAILURE_THRESHOLD: u64 = 3;

/// Steps to splice in right after the reboot step at `index`.
///
/// - A failed `repair.*` step in `recent` adds a network reset and a DISM repair.
/// - Three or more recorded driver-install failures on this machine add a
///   device rescan.
///
/// Steps already queued after `index` under the same name are not added twice.
pub fn adapt(recent: &[Event], knowledge: &KnowledgeStore, plan: &Plan, index: usize) -> Vec<Step> {
    let mut extra = Vec::new();

    let repair_failed = recent.iter().any(|e| {
        e.status.is_failure() && e.kind.as_ref().map(StepKind::is_repair).unwrap_or(false)
    });
    if repair_failed {
        extra.push(Step::new(0, PRE_REBOOT_NETWORK_RESET, StepKind::NetworkReset));
        extra.push(Step::new(0, PRE_REBOOT_DISM, StepKind::Dism));
    }

    let inf = knowledge.counters(INSTALL_INF_STEP);
    if inf.error + inf.exit >= INF_FAILURE_THRESHOLD {
        extra.push(Step::new(0, PRE_REBOOT_RESCAN, StepKind::DriversScan));
    }

    let queued: Vec<&str> = plan
        .steps()
        .iter()
        .skip(index + 1)
        .map(|s| s.name.as_str())
        .collect();
    extra.retain(|s| !queued.contains(&s.name.as_str()));

    if !extra.is_empty() {
        info!(
            index,
            repair_failed,
            inf_failures = inf.error + inf.exit,
            added = extra.len(),
            "Adapting plan before reboot"
        );
    }
    extra
}
