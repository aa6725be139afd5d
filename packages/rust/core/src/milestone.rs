//! Graph-size milestones.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Milestone crossed between two node counts, if any.
///
/// Fires when `current` reaches a multiple of `boundary` that `previous` had
/// not reached, and returns `current / boundary`. A zero boundary never fires.
pub fn detect(current: usize, previous: usize, boundary: u64) -> Option<u64> {
    if boundary == 0 {
        return None;
    }
    let now = current as u64 / boundary;
    let before = previous as u64 / boundary;
    (now > before).then_some(now)
}

/// JSON contract handed to whatever orchestrates post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneReport {
    pub is_milestone: bool,
    pub milestone_number: Option<u64>,
}

impl MilestoneReport {
    pub fn evaluate(current: usize, previous: usize, boundary: u64) -> Self {
        let milestone_number = detect(current, previous, boundary);
        Self {
            is_milestone: milestone_number.is_some(),
            milestone_number,
        }
    }
}

/// `<root>/milestone-<n>`
pub fn milestone_dir(root: &Path, milestone: u64) -> PathBuf {
    root.join(format!("milestone-{milestone}"))
}
