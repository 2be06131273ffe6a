//! Step retry policy.
//!
//! Retries use a fixed delay taken from the workflow. The number of retries
//! comes from the step and is zero when the step disallows retrying.

use std::time::Duration;

use tradeflow_types::workflow::{Workflow, WorkflowStep};

/// Stateless retry decision for one step within one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn for_step(workflow: &Workflow, step: &WorkflowStep) -> Self {
        Self {
            max_retries: step.effective_max_retries(),
            delay: Duration::from_secs(workflow.retry_delay_seconds),
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeflow_types::workflow::StepKind;

    fn fixtures(max_retries: u32, can_retry: bool) -> (Workflow, WorkflowStep) {
        let mut workflow = Workflow::new("Sync", "sync", "supplier_sync");
        workflow.retry_delay_seconds = 7;
        let mut step = WorkflowStep::new(workflow.id, "fetch", StepKind::DataFetch, 1);
        step.max_retries = max_retries;
        step.can_retry = can_retry;
        (workflow, step)
    }

    #[test]
    fn two_retries_means_three_attempts() {
        let (wf, step) = fixtures(2, true);
        let policy = RetryPolicy::for_step(&wf, &step);
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay, Duration::from_secs(7));
    }

    #[test]
    fn can_retry_false_disables_retries() {
        let (wf, step) = fixtures(5, false);
        let policy = RetryPolicy::for_step(&wf, &step);
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1));
    }
}
