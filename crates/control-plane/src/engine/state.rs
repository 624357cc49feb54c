//! Run, node run, stage and job statuses and their aggregation rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Lifecycle status shared by runs, node runs, stages and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Waiting,
    Building,
    Success,
    Fail,
    Stopped,
    Skipped,
    Disabled,
    #[serde(rename = "Never Built")]
    NeverBuilt,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Stopped => "Stopped",
            Self::Skipped => "Skipped",
            Self::Disabled => "Disabled",
            Self::NeverBuilt => "Never Built",
        }
    }

    /// No further transition is expected from this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting | Self::Building)
    }

    /// Status exposed to children as `cds.status`.
    pub fn propagated(&self) -> Status {
        match self {
            Self::Fail | Self::Stopped => *self,
            _ => Self::Success,
        }
    }

    fn stage_rank(&self) -> u8 {
        match self {
            Self::Fail => 5,
            Self::Stopped => 4,
            Self::Success => 3,
            Self::Skipped => 2,
            Self::Disabled => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Building" => Ok(Self::Building),
            "Success" => Ok(Self::Success),
            "Fail" => Ok(Self::Fail),
            "Stopped" => Ok(Self::Stopped),
            "Skipped" => Ok(Self::Skipped),
            "Disabled" => Ok(Self::Disabled),
            "Never Built" | "NeverBuilt" => Ok(Self::NeverBuilt),
            other => Err(AppError::Validation(format!("unknown status '{}'", other))),
        }
    }
}

/// Final status of a stage whose jobs are all terminal.
///
/// Precedence is `Fail > Stopped > Success > Skipped > Disabled`; a stage
/// without jobs succeeds.
pub fn stage_status<I>(jobs: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    jobs.into_iter()
        .filter(|s| s.stage_rank() > 0)
        .max_by_key(|s| s.stage_rank())
        .unwrap_or(Status::Success)
}

/// Counts statuses to derive an aggregate for a node run or a workflow run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounter {
    pub building: usize,
    pub success: usize,
    pub failed: usize,
    pub stopped: usize,
    pub skipped: usize,
    pub disabled: usize,
    pub never_built: usize,
}

impl StatusCounter {
    pub fn add(&mut self, status: Status) {
        match status {
            Status::Waiting | Status::Building => self.building += 1,
            Status::Success => self.success += 1,
            Status::Fail => self.failed += 1,
            Status::Stopped => self.stopped += 1,
            Status::Skipped => self.skipped += 1,
            Status::Disabled => self.disabled += 1,
            Status::NeverBuilt => self.never_built += 1,
        }
    }

    /// `Building > Fail > Stopped > Success > Skipped > Disabled > NeverBuilt`.
    pub fn status(&self) -> Status {
        if self.building > 0 {
            Status::Building
        } else if self.failed > 0 {
            Status::Fail
        } else if self.stopped > 0 {
            Status::Stopped
        } else if self.success > 0 {
            Status::Success
        } else if self.skipped > 0 {
            Status::Skipped
        } else if self.disabled > 0 {
            Status::Disabled
        } else {
            Status::NeverBuilt
        }
    }
}

impl FromIterator<Status> for StatusCounter {
    fn from_iter<T: IntoIterator<Item = Status>>(iter: T) -> Self {
        let mut counter = StatusCounter::default();
        for status in iter {
            counter.add(status);
        }
        counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_round_trip() {
        assert_eq!(Status::NeverBuilt.to_string(), "Never Built");
        assert_eq!("Building".parse::<Status>().unwrap(), Status::Building);
        assert!("running".parse::<Status>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!Status::Waiting.is_terminal());
        assert!(!Status::Building.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(Status::NeverBuilt.is_terminal());
    }

    #[test]
    fn test_stage_with_failure_fails() {
        let status = stage_status([Status::Success, Status::Fail, Status::Skipped]);
        assert_eq!(status, Status::Fail);
    }

    #[test]
    fn test_stage_with_skipped_and_disabled_never_succeeds() {
        let status = stage_status([Status::Skipped, Status::Disabled]);
        assert_eq!(status, Status::Skipped);
        assert_eq!(stage_status([Status::Disabled]), Status::Disabled);
    }

    #[test]
    fn test_stage_success_overrides_skipped() {
        assert_eq!(stage_status([Status::Skipped, Status::Success]), Status::Success);
        assert_eq!(stage_status([Status::Success, Status::Stopped]), Status::Stopped);
        assert_eq!(stage_status(Vec::new()), Status::Success);
    }

    #[test]
    fn test_run_status_building_wins() {
        let counter = StatusCounter {
            success: 1,
            building: 1,
            failed: 1,
            stopped: 1,
            ..Default::default()
        };
        assert_eq!(counter.status(), Status::Building);
    }

    #[test]
    fn test_run_status_stopped_over_success() {
        let counter: StatusCounter = [Status::Success, Status::Stopped].into_iter().collect();
        assert_eq!(counter.status(), Status::Stopped);
    }

    #[test]
    fn test_run_status_waiting_counts_as_building() {
        let counter: StatusCounter = [Status::Fail, Status::Waiting].into_iter().collect();
        assert_eq!(counter.status(), Status::Building);
        assert_eq!(StatusCounter::default().status(), Status::NeverBuilt);
    }

    #[test]
    fn test_propagated_status() {
        assert_eq!(Status::Fail.propagated(), Status::Fail);
        assert_eq!(Status::Skipped.propagated(), Status::Success);
    }
}
