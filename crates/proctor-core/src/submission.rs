//! Submission coordinator: finalizes an attempt exactly once.
//!
//! Order is fixed: stop the clock, flush everything, call the grader, then
//! record the result. A failure at any step leaves the attempt retryable.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::machine::AttemptStateMachine;
use crate::model::{AttemptStatus, OverallStats};
use crate::sync::{ProgressSync, RetryPolicy};
use crate::traits::{FlushReason, Grader, SubmitTrigger};

pub struct SubmissionCoordinator {
    grader: Arc<dyn Grader>,
    policy: RetryPolicy,
    in_flight: bool,
    submitted: u32,
}

impl SubmissionCoordinator {
    pub fn new(grader: Arc<dyn Grader>, policy: RetryPolicy) -> Self {
        Self {
            grader,
            policy,
            in_flight: false,
            submitted: 0,
        }
    }

    /// Successful grader calls made by this coordinator.
    pub fn submitted(&self) -> u32 {
        self.submitted
    }

    /// Finalize the attempt if a submission is pending.
    ///
    /// Returns `Ok(None)` when there is nothing to do (no pending request,
    /// already completed, or another submission is in flight).
    pub async fn finalize(
        &mut self,
        machine: &mut AttemptStateMachine,
        sync: &mut ProgressSync,
    ) -> Result<Option<OverallStats>> {
        let Some(trigger) = machine.pending_submission() else {
            return Ok(None);
        };
        if self.in_flight || machine.status() == AttemptStatus::Completed {
            return Ok(None);
        }
        self.in_flight = true;
        let result = self.finalize_inner(machine, sync, trigger).await;
        self.in_flight = false;

        match result {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                machine.submission_failed(trigger);
                Err(match e {
                    EngineError::PersistenceFailure { message, .. } => {
                        EngineError::PersistenceFailure {
                            message,
                            retryable: true,
                        }
                    }
                    other => other,
                })
            }
        }
    }

    async fn finalize_inner(
        &mut self,
        machine: &mut AttemptStateMachine,
        sync: &mut ProgressSync,
        trigger: SubmitTrigger,
    ) -> Result<OverallStats> {
        machine.stop_clock();
        sync.flush(machine, FlushReason::SectionEnd).await?;

        let request = machine.submit_request(trigger);
        info!(
            attempt = %request.attempt_id,
            %trigger,
            answers = request.answers.len(),
            "submitting attempt"
        );
        let grader = Arc::clone(&self.grader);
        let response = self
            .policy
            .run("submit attempt", || grader.submit_attempt(&request))
            .await?;
        self.submitted += 1;

        if response.status != AttemptStatus::Completed {
            warn!(
                attempt = %request.attempt_id,
                reported = %response.status,
                "grader reported a non-completed status, recording completion"
            );
        }
        machine.complete(response.overall_stats.clone())?;
        // Persist the final status; grading already succeeded, so a failure
        // here is only logged.
        if let Err(e) = sync.flush(machine, FlushReason::Manual).await {
            warn!(attempt = %request.attempt_id, "final status flush failed: {e}");
        }
        Ok(response.overall_stats)
    }
}
