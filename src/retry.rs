// Per-job retry bookkeeping for a running suite

use crate::services::JobId;
use crate::status::{Status, StatusCode};
use eyre::{Result, eyre};
use std::collections::HashMap;
use tracing::debug;

/// Where a job stands with respect to its retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Nothing done yet
    NotAttempted,
    /// Tried to schedule a retry and failed; no further retries
    Attempted,
    /// A retry job exists
    Retried,
}

#[derive(Debug, Clone, Copy)]
struct RetryRecord {
    state: RetryState,
    retry_max: u32,
}

/// Decides which failed jobs get retried.
///
/// A job is retried at most once; its retry inherits `retry_max - 1`. The
/// suite-wide budget caps the total regardless of per-test allowances.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    records: HashMap<JobId, RetryRecord>,
    retry_level: StatusCode,
    max_retries: Option<u32>,
}

impl RetryHandler {
    /// `initial` pairs each originally scheduled job with its test's retry allowance
    pub fn new<I>(initial: I, retry_level: StatusCode, max_retries: Option<u32>) -> Self
    where
        I: IntoIterator<Item = (JobId, u32)>,
    {
        let mut handler = Self {
            records: HashMap::new(),
            retry_level,
            max_retries,
        };
        for (job_id, retries) in initial {
            if retries > 0 {
                handler.records.insert(
                    job_id,
                    RetryRecord {
                        state: RetryState::NotAttempted,
                        retry_max: retries,
                    },
                );
            }
        }
        handler
    }

    pub fn add_job(&mut self, job_id: JobId, retry_max: u32) -> Result<()> {
        if self.records.contains_key(&job_id) {
            return Err(eyre!("Job {} is already tracked for retries", job_id));
        }
        self.records.insert(
            job_id,
            RetryRecord {
                state: RetryState::NotAttempted,
                retry_max,
            },
        );
        Ok(())
    }

    pub fn suite_max_reached(&self) -> bool {
        self.max_retries == Some(0)
    }

    /// Retry only tests that actually ran, failed past the retry level, and
    /// still have budget
    pub fn should_retry(&self, result: &Status) -> bool {
        if self.suite_max_reached() || !result.test_executed {
            return false;
        }
        let threshold = Status::new(self.retry_level, "").with_reason("reason");
        if !result.is_worse_than(&threshold) {
            return false;
        }
        result
            .job_id
            .and_then(|id| self.records.get(&id))
            .is_some_and(|r| r.state == RetryState::NotAttempted && r.retry_max > 0)
    }

    /// Record that `new_job_id` retries `old_job_id`
    pub fn add_retry(&mut self, old_job_id: JobId, new_job_id: JobId) -> Result<()> {
        let old = self
            .records
            .get_mut(&old_job_id)
            .ok_or_else(|| eyre!("Job {} is not tracked for retries", old_job_id))?;
        if old.state != RetryState::NotAttempted {
            return Err(eyre!("Job {} was already retried or attempted", old_job_id));
        }
        old.state = RetryState::Retried;
        let remaining = old.retry_max.saturating_sub(1);
        self.add_job(new_job_id, remaining)?;
        if let Some(max) = self.max_retries.as_mut() {
            *max = max.saturating_sub(1);
        }
        debug!(old_job_id, new_job_id, remaining, "recorded retry");
        Ok(())
    }

    pub fn set_attempted(&mut self, job_id: JobId) -> Result<()> {
        let record = self
            .records
            .get_mut(&job_id)
            .ok_or_else(|| eyre!("Job {} is not tracked for retries", job_id))?;
        if record.state != RetryState::NotAttempted {
            return Err(eyre!(
                "Unexpected state transition for job {}: {:?} -> Attempted",
                job_id,
                record.state
            ));
        }
        record.state = RetryState::Attempted;
        Ok(())
    }

    /// Whether some later job will stand in for this result
    pub fn has_following_retry(&self, result: &Status) -> bool {
        if !result.test_executed {
            return false;
        }
        match result.job_id.and_then(|id| self.records.get(&id)) {
            Some(record) => record.state == RetryState::Retried || self.should_retry(result),
            None => false,
        }
    }

    pub fn retry_max(&self, job_id: JobId) -> Option<u32> {
        self.records.get(&job_id).map(|r| r.retry_max)
    }

    pub fn state(&self, job_id: JobId) -> Option<RetryState> {
        self.records.get(&job_id).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executed(code: StatusCode, job_id: JobId) -> Status {
        let mut status = Status::new(code, "dummy_Flaky").with_times(Some("2014-03-01 10:00:00"), None);
        status.job_id = Some(job_id);
        status
    }

    #[test]
    fn test_should_retry_failed_executed_job() {
        let handler = RetryHandler::new([(1, 2), (2, 0)], StatusCode::Warn, None);
        assert!(handler.should_retry(&executed(StatusCode::Fail, 1)));
        // No allowance
        assert!(!handler.should_retry(&executed(StatusCode::Fail, 2)));
        // WARN with a reason is not worse than the WARN threshold
        assert!(!handler.should_retry(&executed(StatusCode::Warn, 1).with_reason("meh")));
        assert!(!handler.should_retry(&executed(StatusCode::Good, 1)));
    }

    #[test]
    fn test_never_retry_jobs_that_did_not_run() {
        let handler = RetryHandler::new([(1, 2)], StatusCode::Warn, None);
        let mut aborted = Status::new(StatusCode::Abort, "dummy");
        aborted.job_id = Some(1);
        assert!(!handler.should_retry(&aborted));
    }

    #[test]
    fn test_add_retry_chains_budget() {
        let mut handler = RetryHandler::new([(1, 2)], StatusCode::Warn, None);
        handler.add_retry(1, 10).unwrap();
        assert_eq!(handler.state(1), Some(RetryState::Retried));
        assert_eq!(handler.retry_max(10), Some(1));
        assert!(handler.should_retry(&executed(StatusCode::Fail, 10)));

        handler.add_retry(10, 11).unwrap();
        assert_eq!(handler.retry_max(11), Some(0));
        assert!(!handler.should_retry(&executed(StatusCode::Fail, 11)));

        assert!(handler.add_retry(1, 12).is_err());
    }

    #[test]
    fn test_suite_budget() {
        let mut handler = RetryHandler::new([(1, 3), (2, 3)], StatusCode::Warn, Some(1));
        handler.add_retry(1, 10).unwrap();
        assert!(handler.suite_max_reached());
        assert!(!handler.should_retry(&executed(StatusCode::Fail, 2)));
    }

    #[test]
    fn test_attempted_blocks_further_retries() {
        let mut handler = RetryHandler::new([(1, 3)], StatusCode::Warn, None);
        handler.set_attempted(1).unwrap();
        assert!(!handler.should_retry(&executed(StatusCode::Fail, 1)));
        assert!(!handler.has_following_retry(&executed(StatusCode::Fail, 1)));
        assert!(handler.set_attempted(1).is_err());
    }

    #[test]
    fn test_has_following_retry() {
        let mut handler = RetryHandler::new([(1, 1)], StatusCode::Warn, None);
        let failed = executed(StatusCode::Fail, 1);
        assert!(handler.has_following_retry(&failed));
        handler.add_retry(1, 5).unwrap();
        assert!(handler.has_following_retry(&failed));
        assert!(!handler.has_following_retry(&executed(StatusCode::Fail, 5)));
        assert!(!handler.has_following_retry(&executed(StatusCode::Fail, 99)));
    }

    #[test]
    fn test_add_job_twice_fails() {
        let mut handler = RetryHandler::new(Vec::<(JobId, u32)>::new(), StatusCode::Warn, None);
        handler.add_job(3, 1).unwrap();
        assert!(handler.add_job(3, 1).is_err());
    }
}
