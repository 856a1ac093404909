// Polling the job service and turning finished jobs into statuses

use crate::host_group::HostGroup;
use crate::services::{HostLockManager, HostQuery, HostQueueEntry, Job, JobId, JobQuery, JobService, ResultStore, TestStatus};
use crate::status::{CLIENT_JOB, SERVER_JOB, Status, StatusCode, StatusRecorder};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use eyre::Result;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval for the start/finish/lock waiters
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Interval for result streaming
pub const RESULTS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Fraction of aborted queue entries above which a job is unhealthy
pub const DEFAULT_ABORT_THRESHOLD: f64 = 0.5;

/// Host status meaning a job is executing on it
pub const HOST_RUNNING: &str = "Running";

/// Polling cadence and deadline shared by every job in a batch
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub interval: Duration,
    /// Defaults to the moment the wait begins
    pub start_time: Option<DateTime<Utc>>,
    pub timeout_mins: Option<u64>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            start_time: None,
            timeout_mins: None,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout_mins(mut self, mins: u64) -> Self {
        self.timeout_mins = Some(mins);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    fn deadline(&self) -> Option<DateTime<Utc>> {
        let start = self.start_time.unwrap_or_else(Utc::now);
        self.timeout_mins.map(|mins| {
            i64::try_from(mins)
                .ok()
                .and_then(ChronoDuration::try_minutes)
                .and_then(|d| start.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }
}

fn timed_out(deadline: Option<DateTime<Utc>>) -> bool {
    deadline.is_some_and(|d| Utc::now() >= d)
}

fn abort_jobs(afe: &dyn JobService, job_ids: &[JobId]) -> Result<()> {
    for &job_id in job_ids {
        warn!(job_id, "Timed out waiting for job, aborting");
        afe.abort_host_queue_entries(job_id)?;
    }
    Ok(())
}

/// Wait until no job is reported "not yet run".
///
/// Returns `false` after aborting the stragglers when the deadline passes.
pub fn wait_for_jobs_to_start(afe: &dyn JobService, jobs: &[Job], opts: &WaitOptions) -> Result<bool> {
    wait_for_jobs(afe, jobs, opts, "start", |id| JobQuery::id(id).not_yet_run(), true)
}

/// Wait until every job is reported finished; same timeout behaviour
pub fn wait_for_jobs_to_finish(afe: &dyn JobService, jobs: &[Job], opts: &WaitOptions) -> Result<bool> {
    wait_for_jobs(afe, jobs, opts, "finish", |id| JobQuery::id(id).finished(), false)
}

/// `pending_when_found` says whether a non-empty answer means the job is still pending
fn wait_for_jobs(
    afe: &dyn JobService,
    jobs: &[Job],
    opts: &WaitOptions,
    what: &str,
    query: impl Fn(JobId) -> JobQuery,
    pending_when_found: bool,
) -> Result<bool> {
    let deadline = opts.deadline();
    let mut pending: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

    loop {
        let mut still_pending = Vec::with_capacity(pending.len());
        for &job_id in &pending {
            let found = !afe.get_jobs(&query(job_id))?.is_empty();
            if found == pending_when_found {
                still_pending.push(job_id);
            } else {
                debug!(job_id, "Job did {}", what);
            }
        }
        pending = still_pending;

        if pending.is_empty() {
            return Ok(true);
        }
        if timed_out(deadline) {
            abort_jobs(afe, &pending)?;
            return Ok(false);
        }
        thread::sleep(opts.interval);
    }
}

/// Hostnames of a job's queue entries; `None` for entries without a host yet
pub fn gather_job_hostnames(afe: &dyn JobService, job: &Job) -> Result<Vec<Option<String>>> {
    Ok(afe
        .get_host_queue_entries(job.id)?
        .iter()
        .map(|e| e.hostname().map(str::to_string))
        .collect())
}

/// Lock each job host the first time it is seen running.
///
/// Returns when every expected host is locked, or with whatever was locked so
/// far once the deadline passes (after aborting the jobs).
pub fn wait_for_and_lock_job_hosts(
    afe: &dyn JobService,
    jobs: &[Job],
    manager: &dyn HostLockManager,
    opts: &WaitOptions,
) -> Result<BTreeSet<String>> {
    let deadline = opts.deadline();
    let mut locked: BTreeSet<String> = BTreeSet::new();

    loop {
        let mut expected: BTreeSet<Option<String>> = BTreeSet::new();
        for job in jobs {
            expected.extend(gather_job_hostnames(afe, job)?);
        }

        let candidates: Vec<String> = expected
            .iter()
            .flatten()
            .filter(|h| !locked.contains(*h))
            .cloned()
            .collect();

        if !candidates.is_empty() {
            let running = afe.get_hosts(&HostQuery {
                hostnames: candidates.clone(),
                status: Some(HOST_RUNNING.to_string()),
                labels: Vec::new(),
            })?;
            let newly: Vec<String> = running
                .into_iter()
                .map(|h| h.hostname)
                .filter(|h| candidates.contains(h))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !newly.is_empty() {
                info!(hosts = ?newly, "Locking running hosts");
                manager.lock(&newly)?;
                locked.extend(newly);
            }
        }

        let all_locked = expected
            .iter()
            .all(|h| h.as_ref().is_some_and(|name| locked.contains(name)));
        if all_locked {
            return Ok(locked);
        }
        if timed_out(deadline) {
            let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
            abort_jobs(afe, &ids)?;
            return Ok(locked);
        }
        thread::sleep(opts.interval);
    }
}

/// True when any job has more than `threshold` of its entries aborted
pub fn check_job_abort_status(afe: &dyn JobService, jobs: &[Job], threshold: f64) -> Result<bool> {
    let mut has_failures = false;
    for job in jobs {
        let entries = afe.get_host_queue_entries(job.id)?;
        if entries.is_empty() {
            continue;
        }
        let aborted = entries.iter().filter(|e| e.aborted).count();
        let ratio = aborted as f64 / entries.len() as f64;
        if ratio > threshold {
            warn!(
                job_id = job.id,
                aborted,
                total = entries.len(),
                threshold,
                "Too many aborted host queue entries"
            );
            has_failures = true;
        }
    }
    Ok(has_failures)
}

fn is_test_status(status: &TestStatus) -> bool {
    !(status.test_name.starts_with(SERVER_JOB) || status.test_name.starts_with(CLIENT_JOB))
}

fn parse_code(raw: &str) -> (StatusCode, Option<String>) {
    match raw.parse::<StatusCode>() {
        Ok(code) => (code, None),
        Err(_) => (StatusCode::Error, Some(format!("unrecognised status {}", raw))),
    }
}

fn to_status(job: &Job, row: &TestStatus, test_name: String, fallback_host: Option<&str>) -> Status {
    let (code, note) = parse_code(&row.status);
    let reason = match note {
        Some(note) if row.reason.is_empty() => note,
        Some(note) => format!("{} ({})", row.reason, note),
        None => row.reason.clone(),
    };
    let hostname = if row.hostname.is_empty() {
        fallback_host.unwrap_or_default().to_string()
    } else {
        row.hostname.clone()
    };
    Status::new(code, test_name)
        .with_reason(reason)
        .with_times(row.test_started_time.as_deref(), row.test_finished_time.as_deref())
        .with_job(job)
        .with_hostname(hostname)
        .with_subdir(row.subdir.clone())
}

/// Statuses for one finished job.
///
/// A job without any test rows yields a single ABORT. Harness rows are only
/// reported when they are not GOOD and no real test failed.
pub fn job_results(afe: &dyn JobService, tko: &dyn ResultStore, job: &Job) -> Result<Vec<Status>> {
    let entries = afe.get_host_queue_entries(job.id)?;
    let fallback_host = entries.iter().find_map(HostQueueEntry::hostname);
    let rows = tko.get_job_test_statuses(job.id)?;

    if rows.is_empty() {
        debug!(job_id = job.id, "Job finished without test statuses");
        let mut status = Status::new(StatusCode::Abort, job.name.clone()).with_job(job);
        if let Some(host) = fallback_host {
            status = status.with_hostname(host);
        }
        return Ok(vec![status]);
    }

    let contains_test_failure = rows.iter().any(|r| is_test_status(r) && r.status != "GOOD");

    let mut results = Vec::new();
    for row in &rows {
        if is_test_status(row) {
            results.push(to_status(job, row, row.test_name.clone(), fallback_host));
        } else if row.status != "GOOD" && !contains_test_failure {
            let name = format!("{}_{}", job.name, row.test_name);
            results.push(to_status(job, row, name, fallback_host));
        }
    }
    Ok(results)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    /// Ask about each job individually, in the order supplied
    PerJob,
    /// One query for all outstanding children of a suite job
    Batch,
}

/// Streams statuses as jobs finish.
///
/// The worklist stays open while iterating: jobs passed to [`add_jobs`] are
/// merged before the next poll, so retries scheduled by the consumer are
/// waited on without restarting the stream.
///
/// [`add_jobs`]: ResultPoller::add_jobs
pub struct ResultPoller<'a> {
    afe: &'a dyn JobService,
    tko: &'a dyn ResultStore,
    mode: PollMode,
    outstanding: Vec<Job>,
    injected: Vec<Job>,
    ready: VecDeque<Status>,
    interval: Duration,
    polled: bool,
}

impl<'a> ResultPoller<'a> {
    /// Wait on an explicit set of jobs
    pub fn for_jobs(afe: &'a dyn JobService, tko: &'a dyn ResultStore, jobs: Vec<Job>) -> Self {
        Self {
            afe,
            tko,
            mode: PollMode::PerJob,
            outstanding: jobs,
            injected: Vec::new(),
            ready: VecDeque::new(),
            interval: RESULTS_POLL_INTERVAL,
            polled: false,
        }
    }

    /// Wait on every child of a suite job
    pub fn for_children(afe: &'a dyn JobService, tko: &'a dyn ResultStore, parent_job_id: JobId) -> Result<Self> {
        let children = afe.get_jobs(&JobQuery::children_of(parent_job_id))?;
        info!(parent_job_id, children = children.len(), "Waiting on child jobs");
        Ok(Self {
            mode: PollMode::Batch,
            ..Self::for_jobs(afe, tko, children)
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Add jobs to wait on; they are included in the next poll
    pub fn add_jobs<I: IntoIterator<Item = Job>>(&mut self, jobs: I) {
        self.injected.extend(jobs);
    }

    /// Jobs not yet seen finished, including ones added since the last poll
    pub fn outstanding(&self) -> usize {
        self.outstanding.len() + self.injected.len()
    }

    fn merge_injected(&mut self) {
        for job in self.injected.drain(..) {
            if !self.outstanding.iter().any(|j| j.id == job.id) {
                debug!(job_id = job.id, "Added job to result poll");
                self.outstanding.push(job);
            }
        }
    }

    fn finished_ids(&self) -> Result<HashSet<JobId>> {
        match self.mode {
            PollMode::PerJob => {
                let mut done = HashSet::new();
                for job in &self.outstanding {
                    if !self.afe.get_jobs(&JobQuery::id(job.id).finished())?.is_empty() {
                        done.insert(job.id);
                    }
                }
                Ok(done)
            }
            PollMode::Batch => {
                let query = JobQuery {
                    ids: self.outstanding.iter().map(|j| j.id).collect(),
                    finished: Some(true),
                    ..JobQuery::default()
                };
                Ok(self.afe.get_jobs(&query)?.into_iter().map(|j| j.id).collect())
            }
        }
    }

    fn poll(&mut self) -> Result<()> {
        let done = self.finished_ids()?;
        if done.is_empty() {
            return Ok(());
        }

        let (finished, remaining): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut self.outstanding).into_iter().partition(|j| done.contains(&j.id));
        self.outstanding = remaining;

        for job in finished {
            debug!(job_id = job.id, "Job finished");
            self.ready.extend(job_results(self.afe, self.tko, &job)?);
        }
        Ok(())
    }
}

impl Iterator for ResultPoller<'_> {
    type Item = Result<Status>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(status) = self.ready.pop_front() {
                return Some(Ok(status));
            }
            self.merge_injected();
            if self.outstanding.is_empty() {
                return None;
            }
            if self.polled {
                thread::sleep(self.interval);
            }
            self.polled = true;
            if let Err(e) = self.poll() {
                return Some(Err(e));
            }
        }
    }
}

fn status_for_queue_entry(entry_status: &str) -> StatusCode {
    match entry_status {
        "Failed" => StatusCode::Fail,
        _ => StatusCode::Abort,
    }
}

/// Worst status per host across `jobs`.
///
/// Hosts that never produced a test row are reported from their queue entry
/// with reason `Did not run`. Rows with no hostname are keyed under `""`.
pub fn gather_per_host_results(
    afe: &dyn JobService,
    tko: &dyn ResultStore,
    jobs: &[Job],
    name_prefix: &str,
) -> Result<BTreeMap<String, Status>> {
    let mut per_host: BTreeMap<String, Status> = BTreeMap::new();

    for job in jobs {
        let entries = afe.get_host_queue_entries(job.id)?;
        let rows = tko.get_job_test_statuses(job.id)?;

        // Rows without a hostname are kept together under "".
        for row in &rows {
            let status = to_status(job, row, format!("{}{}", name_prefix, row.hostname), None);
            let replace = per_host
                .get(&row.hostname)
                .is_none_or(|current| status.is_worse_than(current));
            if replace {
                per_host.insert(row.hostname.clone(), status);
            }
        }

        for entry in &entries {
            let Some(hostname) = entry.hostname() else {
                continue;
            };
            if per_host.contains_key(hostname) {
                continue;
            }
            let status = Status::new(status_for_queue_entry(&entry.status), format!("{}{}", name_prefix, hostname))
                .with_reason("Did not run")
                .with_job(job)
                .with_hostname(hostname);
            per_host.insert(hostname.to_string(), status);
        }
    }

    Ok(per_host)
}

/// Record every host's reimage result.
///
/// With a quorum of good hosts, failures are recorded as WARN; otherwise at
/// their own severity. Returns whether the quorum was met.
pub fn check_and_record_reimage_results(
    results: &BTreeMap<String, Status>,
    group: &mut dyn HostGroup,
    recorder: &mut dyn StatusRecorder,
) -> Result<bool> {
    let mut failures = Vec::new();
    for (hostname, status) in results {
        if status.is_good() {
            group.mark_host_success(hostname);
            status.record_all(recorder)?;
        } else {
            failures.push(status);
        }
    }

    let enough = group.enough_hosts_succeeded();
    for failure in failures {
        if enough {
            failure.clone().demoted(StatusCode::Warn).record_all(recorder)?;
        } else {
            failure.record_all(recorder)?;
        }
    }
    info!(enough, "Recorded reimage results");
    Ok(enough)
}
