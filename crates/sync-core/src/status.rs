//! Progress and error reporting for sync passes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    Pull,
    Push,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::Pull => f.write_str("pull"),
            SyncDirection::Push => f.write_str("push"),
        }
    }
}

/// Where a pass currently is.
///
/// `Idle → Preparing → Fetching → Processing → Completed | Cancelled | Failed`.
/// Push passes skip `Fetching`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Preparing,
    Fetching,
    Processing {
        current: usize,
        total: usize,
    },
    Completed,
    Cancelled,
    Failed,
}

impl SyncPhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Preparing | SyncPhase::Fetching | SyncPhase::Processing { .. }
        )
    }
}

/// A failure recorded during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorEntry {
    /// Note title, id or path the error refers to.
    pub label: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncErrorEntry {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Counts reported at the end of every pass, including failed ones.
///
/// For a pass that ran to completion `succeeded + skipped + errored == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub direction: SyncDirection,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub cancelled: bool,
}

impl SyncSummary {
    pub fn new(direction: SyncDirection, total: usize) -> Self {
        Self {
            direction,
            total,
            succeeded: 0,
            skipped: 0,
            errored: 0,
            cancelled: false,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.errored
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} total, {} succeeded, {} skipped, {} errored",
            self.direction, self.total, self.succeeded, self.skipped, self.errored
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Snapshot of the manager's progress. Observers get clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub current_item: Option<String>,
    pub errors: Vec<SyncErrorEntry>,
    pub last_summary: Option<SyncSummary>,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.phase.is_active()
    }

    /// Start a new pass. The previous summary survives until this one ends.
    pub fn reset(&mut self) {
        *self = SyncStatus {
            phase: SyncPhase::Preparing,
            last_summary: self.last_summary.take(),
            ..SyncStatus::default()
        };
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_last_summary() {
        let mut status = SyncStatus {
            phase: SyncPhase::Completed,
            completed: 3,
            errors: vec![SyncErrorEntry::new("a", "boom")],
            last_summary: Some(SyncSummary::new(SyncDirection::Pull, 3)),
            ..SyncStatus::default()
        };

        status.reset();

        assert_eq!(status.phase, SyncPhase::Preparing);
        assert!(status.is_syncing());
        assert_eq!(status.completed, 0);
        assert!(status.errors.is_empty());
        assert!(status.last_summary.is_some());
    }

    #[test]
    fn test_summary_display() {
        let mut summary = SyncSummary::new(SyncDirection::Push, 5);
        summary.succeeded = 4;
        summary.errored = 1;
        assert_eq!(
            summary.to_string(),
            "push: 5 total, 4 succeeded, 0 skipped, 1 errored"
        );
        summary.cancelled = true;
        assert!(summary.to_string().ends_with("(cancelled)"));
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&SyncPhase::Processing { current: 2, total: 9 }).unwrap();
        assert_eq!(json, r#"{"phase":"processing","current":2,"total":9}"#);
    }
}
