//! Changes collected while a transaction is open.
//!
//! Events are published and run requests enqueued only after the
//! transaction that produced them commits.

use serde::{Deserialize, Serialize};

use crate::db::models::{JobRun, NodeRun, WorkflowRun};
use crate::engine::state::Status;

/// "This run needs processing", optionally naming the node run to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: i64,
    #[serde(default)]
    pub node_run_id: Option<i64>,
}

impl RunRequest {
    pub fn run(run_id: i64) -> Self {
        Self {
            run_id,
            node_run_id: None,
        }
    }

    pub fn node_run(run_id: i64, node_run_id: i64) -> Self {
        Self {
            run_id,
            node_run_id: Some(node_run_id),
        }
    }
}

/// Observability event for the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Run {
        run_id: i64,
        workflow_id: i64,
        number: i64,
        status: Status,
    },
    NodeRun {
        run_id: i64,
        node_run_id: i64,
        node: String,
        sub_number: i64,
        status: Status,
    },
    JobRun {
        run_id: i64,
        node_run_id: i64,
        job_run_id: i64,
        job: String,
        status: Status,
    },
}

impl RunEvent {
    /// Subject suffix on the event bus.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::NodeRun { .. } => "node_run",
            Self::JobRun { .. } => "job_run",
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessorReport {
    events: Vec<RunEvent>,
    requests: Vec<RunRequest>,
}

impl ProcessorReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_run(&mut self, run: &WorkflowRun) {
        self.push(RunEvent::Run {
            run_id: run.id,
            workflow_id: run.workflow_id,
            number: run.number,
            status: run.status,
        });
    }

    pub fn add_node_run(&mut self, node_run: &NodeRun) {
        self.push(RunEvent::NodeRun {
            run_id: node_run.workflow_run_id,
            node_run_id: node_run.id,
            node: node_run.node_name.clone(),
            sub_number: node_run.sub_number,
            status: node_run.status,
        });
    }

    pub fn add_job_run(&mut self, job: &JobRun) {
        self.push(RunEvent::JobRun {
            run_id: job.workflow_run_id,
            node_run_id: job.node_run_id,
            job_run_id: job.id,
            job: job.job.name.clone(),
            status: job.status,
        });
    }

    fn push(&mut self, event: RunEvent) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    pub fn enqueue(&mut self, request: RunRequest) {
        if !self.requests.contains(&request) {
            self.requests.push(request);
        }
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn requests(&self) -> &[RunRequest] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.requests.is_empty()
    }

    pub fn merge(&mut self, other: ProcessorReport) {
        for event in other.events {
            self.push(event);
        }
        for request in other.requests {
            self.enqueue(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_entries_are_collapsed() {
        let mut report = ProcessorReport::new();
        report.enqueue(RunRequest::run(1));
        report.enqueue(RunRequest::run(1));
        report.enqueue(RunRequest::node_run(1, 2));
        assert_eq!(report.requests().len(), 2);

        let mut other = ProcessorReport::new();
        other.enqueue(RunRequest::node_run(1, 2));
        report.merge(other);
        assert_eq!(report.requests().len(), 2);
    }

    #[test]
    fn test_event_subjects() {
        let event = RunEvent::Run {
            run_id: 1,
            workflow_id: 7,
            number: 3,
            status: Status::Success,
        };
        assert_eq!(event.subject(), "run");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "run");
        assert_eq!(json["status"], "Success");
    }
}
