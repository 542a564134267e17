//! Settle-and-elect debounce for processor launches.
//!
//! Every emitted event schedules a settle check carrying its own
//! timestamp. After the settle window the check compares itself against
//! the shared activity marker: if a newer event has landed, this check
//! stands down and lets the newer one elect itself. The winner still has
//! to get past the processor lock, so at most one processor runs.

use atp_core::{AuditConfig, AuditPaths};
use std::time::Duration;
use tracing::{debug, warn};

/// Slack for marker comparisons. Marker writes truncate to microseconds
/// and clocks on network filesystems drift a little; two checks within
/// this distance are treated as the same event.
pub const MARKER_TOLERANCE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleDecision {
    /// Auditing is off; nothing to launch.
    Disabled,
    /// A newer event arrived during the settle window.
    DeferNewerMarker,
    /// Another processor holds a live lock.
    DeferLiveLock,
    /// This check won the election.
    Proceed { removed_stale_lock: bool },
}

pub struct SettleController {
    paths: AuditPaths,
    config: AuditConfig,
}

impl SettleController {
    pub fn new(paths: AuditPaths, config: AuditConfig) -> Self {
        Self { paths, config }
    }

    /// Pure election rule, separated from the filesystem reads so the
    /// edge cases stay testable without sleeping.
    pub fn decide(
        config: &AuditConfig,
        own_timestamp: f64,
        marker_timestamp: Option<f64>,
        lock_age: Option<Duration>,
    ) -> SettleDecision {
        if !config.enabled {
            return SettleDecision::Disabled;
        }

        let tolerance = MARKER_TOLERANCE_MS as f64 / 1_000.0;
        if let Some(marker) = marker_timestamp {
            if marker > own_timestamp + tolerance {
                return SettleDecision::DeferNewerMarker;
            }
        }

        match lock_age {
            Some(age) if age.as_secs() < config.lock_stale_seconds => {
                SettleDecision::DeferLiveLock
            }
            Some(_) => SettleDecision::Proceed {
                removed_stale_lock: true,
            },
            None => SettleDecision::Proceed {
                removed_stale_lock: false,
            },
        }
    }

    /// Applies the election rule to the on-disk marker and lock state.
    /// A missing or unreadable marker counts as "no newer event".
    pub fn check(&self, own_timestamp: f64) -> SettleDecision {
        let marker_timestamp = std::fs::read_to_string(&self.paths.marker)
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok());
        let lock_age = std::fs::metadata(&self.paths.processor_lock)
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|mtime| mtime.elapsed().ok());

        let decision = Self::decide(&self.config, own_timestamp, marker_timestamp, lock_age);
        if let SettleDecision::Proceed {
            removed_stale_lock: true,
        } = decision
        {
            if let Err(err) = std::fs::remove_file(&self.paths.processor_lock) {
                warn!(error = %err, "failed to remove stale processor lock");
            }
        }
        decision
    }

    /// Sleeps out the settle window, then runs the election and invokes
    /// the launcher if this check won.
    pub fn run(&self, own_timestamp: f64, launch: impl FnOnce()) -> SettleDecision {
        std::thread::sleep(Duration::from_secs(self.config.settle_seconds));
        let decision = self.check(own_timestamp);
        debug!(?decision, "settle check finished");
        if matches!(decision, SettleDecision::Proceed { .. }) {
            launch();
        }
        decision
    }
}
