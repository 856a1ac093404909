// In-memory service fakes shared by the unit tests

use crate::error::{ResolutionError, SchedulingError};
use crate::services::{
    ArtifactKind, ArtifactStore, Host, HostLockManager, HostQuery, HostQueueEntry, ImageServer, Job, JobId, JobQuery,
    JobService, ManifestSource, ResultStore, SuiteRequest, SuiteScheduler, TestStatus,
};
use crate::status::Status;
use crate::suite::{BugReporter, BugTemplate, ScheduledTest, Suite, SuiteFactory, SuiteSpec};
use eyre::{Result, eyre};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

pub fn job(id: JobId, name: &str) -> Job {
    Job {
        id,
        owner: "chromeos-test".to_string(),
        name: name.to_string(),
        parent_job_id: None,
    }
}

/// A result-store row that ran at a fixed time
pub fn row(status: &str, test_name: &str, hostname: &str, reason: &str) -> TestStatus {
    TestStatus {
        status: status.to_string(),
        test_name: test_name.to_string(),
        reason: reason.to_string(),
        test_started_time: Some("2014-03-01 10:00:00".to_string()),
        test_finished_time: Some("2014-03-01 10:05:00".to_string()),
        hostname: hostname.to_string(),
        job_tag: String::new(),
        subdir: Some(test_name.to_string()),
    }
}

struct FakeJob {
    job: Job,
    start_after: usize,
    finish_after: usize,
    start_polls: usize,
    finish_polls: usize,
}

struct FakeEntry {
    entry: HostQueueEntry,
    assign: Option<(String, usize)>,
}

struct FakeHost {
    labels: Vec<String>,
    status: String,
    running_after: Option<usize>,
}

#[derive(Default)]
struct AfeState {
    jobs: Vec<FakeJob>,
    entries: Vec<FakeEntry>,
    entry_polls: HashMap<JobId, usize>,
    hosts: BTreeMap<String, FakeHost>,
    host_polls: usize,
    aborted: Vec<JobId>,
}

/// Job service whose jobs start and finish after a set number of polls
#[derive(Default)]
pub struct FakeJobService {
    state: RefCell<AfeState>,
}

fn host(hostname: &str) -> Host {
    Host {
        hostname: hostname.to_string(),
        status: "Ready".to_string(),
        labels: Vec::new(),
        locked: false,
    }
}

impl FakeJobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The job reports "not yet run" for `start_after` polls and unfinished
    /// for `finish_after` polls
    pub fn add_job(&self, job: Job, start_after: usize, finish_after: usize) {
        self.state.borrow_mut().jobs.push(FakeJob {
            job,
            start_after,
            finish_after,
            start_polls: 0,
            finish_polls: 0,
        });
    }

    pub fn add_entry(&self, job_id: JobId, status: &str, hostname: Option<&str>, aborted: bool) {
        self.state.borrow_mut().entries.push(FakeEntry {
            entry: HostQueueEntry {
                job_id,
                status: status.to_string(),
                host: hostname.map(host),
                aborted,
            },
            assign: None,
        });
    }

    /// The job's first unassigned entry gets `hostname` from its `after`th listing on
    pub fn assign_host_after(&self, job_id: JobId, hostname: &str, after: usize) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.entry.job_id == job_id && e.entry.host.is_none() && e.assign.is_none())
        {
            entry.assign = Some((hostname.to_string(), after));
        }
    }

    pub fn add_host(&self, hostname: &str, labels: &[&str], status: &str) {
        self.state.borrow_mut().hosts.insert(
            hostname.to_string(),
            FakeHost {
                labels: labels.iter().map(|l| l.to_string()).collect(),
                status: status.to_string(),
                running_after: None,
            },
        );
    }

    /// The host reports Running from the `after`th host query on
    pub fn set_host_running_after(&self, hostname: &str, after: usize) {
        let mut state = self.state.borrow_mut();
        let entry = state.hosts.entry(hostname.to_string()).or_insert_with(|| FakeHost {
            labels: Vec::new(),
            status: "Ready".to_string(),
            running_after: None,
        });
        entry.running_after = Some(after);
    }

    pub fn aborted(&self) -> Vec<JobId> {
        self.state.borrow().aborted.clone()
    }
}

impl JobService for FakeJobService {
    fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut state = self.state.borrow_mut();
        let mut found = Vec::new();
        for fake in state.jobs.iter_mut() {
            if !query.ids.is_empty() && !query.ids.contains(&fake.job.id) {
                continue;
            }
            if query.parent_job_id.is_some() && query.parent_job_id != fake.job.parent_job_id {
                continue;
            }
            if query.not_yet_run == Some(true) {
                let pending = fake.start_polls < fake.start_after;
                fake.start_polls += 1;
                if !pending {
                    continue;
                }
            }
            if query.finished == Some(true) {
                let done = fake.finish_polls >= fake.finish_after;
                fake.finish_polls += 1;
                if !done {
                    continue;
                }
            }
            found.push(fake.job.clone());
        }
        Ok(found)
    }

    fn get_host_queue_entries(&self, job_id: JobId) -> Result<Vec<HostQueueEntry>> {
        let mut state = self.state.borrow_mut();
        let polls = *state.entry_polls.get(&job_id).unwrap_or(&0);
        state.entry_polls.insert(job_id, polls + 1);

        let mut found = Vec::new();
        for fake in state.entries.iter_mut().filter(|e| e.entry.job_id == job_id) {
            if let Some((hostname, after)) = fake.assign.clone() {
                if polls >= after {
                    fake.entry.host = Some(host(&hostname));
                    fake.assign = None;
                }
            }
            found.push(fake.entry.clone());
        }
        Ok(found)
    }

    fn get_hosts(&self, query: &HostQuery) -> Result<Vec<Host>> {
        let mut state = self.state.borrow_mut();
        let polls = state.host_polls;
        state.host_polls += 1;

        let mut found = Vec::new();
        for (hostname, fake) in &state.hosts {
            if !query.hostnames.is_empty() && !query.hostnames.contains(hostname) {
                continue;
            }
            if !query.labels.iter().all(|l| fake.labels.contains(l)) {
                continue;
            }
            let status = if fake.running_after.is_some_and(|n| polls >= n) {
                "Running".to_string()
            } else {
                fake.status.clone()
            };
            if query.status.as_ref().is_some_and(|s| *s != status) {
                continue;
            }
            found.push(Host {
                hostname: hostname.clone(),
                status,
                labels: fake.labels.clone(),
                locked: false,
            });
        }
        Ok(found)
    }

    fn abort_host_queue_entries(&self, job_id: JobId) -> Result<()> {
        self.state.borrow_mut().aborted.push(job_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeResultStore {
    rows: RefCell<HashMap<JobId, Vec<TestStatus>>>,
    unavailable: RefCell<Vec<JobId>>,
}

impl FakeResultStore {
    pub fn add(&self, job_id: JobId, row: TestStatus) {
        self.rows.borrow_mut().entry(job_id).or_default().push(row);
    }

    /// Lookups for `job_id` fail
    pub fn unavailable_for(&self, job_id: JobId) {
        self.unavailable.borrow_mut().push(job_id);
    }
}

impl ResultStore for FakeResultStore {
    fn get_job_test_statuses(&self, job_id: JobId) -> Result<Vec<TestStatus>> {
        if self.unavailable.borrow().contains(&job_id) {
            return Err(eyre!("tko query for job {} timed out", job_id));
        }
        Ok(self.rows.borrow().get(&job_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeLockManager {
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakeLockManager {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }
}

impl HostLockManager for FakeLockManager {
    fn lock(&self, hostnames: &[String]) -> Result<()> {
        self.calls.borrow_mut().push(hostnames.to_vec());
        Ok(())
    }
}

/// Latest manifest per `(board, build_type)`, optionally pinned per milestone
#[derive(Default)]
pub struct FakeManifests {
    latest: HashMap<(String, String), (u32, String)>,
    by_milestone: HashMap<(String, String, u32), String>,
    lookups: RefCell<usize>,
}

impl FakeManifests {
    pub fn with_latest(mut self, board: &str, build_type: &str, milestone: u32, manifest: &str) -> Self {
        self.latest
            .insert((board.to_string(), build_type.to_string()), (milestone, manifest.to_string()));
        self
    }

    pub fn with_milestone(mut self, board: &str, build_type: &str, milestone: u32, manifest: &str) -> Self {
        self.by_milestone
            .insert((board.to_string(), build_type.to_string(), milestone), manifest.to_string());
        self
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.borrow()
    }
}

impl ManifestSource for FakeManifests {
    fn latest_manifest(
        &self,
        board: &str,
        build_type: &str,
        milestone: Option<u32>,
    ) -> Result<(u32, String), ResolutionError> {
        *self.lookups.borrow_mut() += 1;
        let missing = || ResolutionError::NoManifest {
            board: board.to_string(),
            build_type: build_type.to_string(),
            milestone,
        };
        match milestone {
            Some(m) => self
                .by_milestone
                .get(&(board.to_string(), build_type.to_string(), m))
                .map(|manifest| (m, manifest.clone()))
                .ok_or_else(missing),
            None => self
                .latest
                .get(&(board.to_string(), build_type.to_string()))
                .cloned()
                .ok_or_else(missing),
        }
    }
}

/// Records requests; builds listed as duplicates or failures answer accordingly
#[derive(Default)]
pub struct RecordingScheduler {
    requests: RefCell<Vec<SuiteRequest>>,
    duplicates: Vec<String>,
    dedup_errors: Vec<String>,
    unreachable: Vec<String>,
}

impl RecordingScheduler {
    pub fn with_duplicate(mut self, build: &str) -> Self {
        self.duplicates.push(build.to_string());
        self
    }

    pub fn with_dedup_error(mut self, build: &str) -> Self {
        self.dedup_errors.push(build.to_string());
        self
    }

    pub fn with_unreachable(mut self, build: &str) -> Self {
        self.unreachable.push(build.to_string());
        self
    }

    pub fn requests(&self) -> Vec<SuiteRequest> {
        self.requests.borrow().clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.requests.borrow().iter().map(|r| r.cros_build.clone()).collect()
    }
}

impl SuiteScheduler for RecordingScheduler {
    fn schedule_suite(&self, request: &SuiteRequest) -> Result<bool, SchedulingError> {
        self.requests.borrow_mut().push(request.clone());
        if self.dedup_errors.contains(&request.cros_build) {
            return Err(SchedulingError::Dedup(format!("dedup lookup failed for {}", request.cros_build)));
        }
        if self.unreachable.contains(&request.cros_build) {
            return Err(SchedulingError::Rpc(format!("could not reach scheduler for {}", request.cros_build)));
        }
        Ok(!self.duplicates.contains(&request.cros_build))
    }
}

type StagedLog = Rc<RefCell<Vec<(String, Vec<ArtifactKind>)>>>;

struct FakeImageServer {
    url: String,
    fail: bool,
    staged: StagedLog,
}

impl ImageServer for FakeImageServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn stage_artifacts(&self, build: &str, artifacts: &[ArtifactKind]) -> Result<()> {
        if self.fail {
            return Err(eyre!("staging {} timed out", build));
        }
        self.staged.borrow_mut().push((build.to_string(), artifacts.to_vec()));
        Ok(())
    }
}

/// Devserver pool that stages instantly unless told otherwise
#[derive(Default)]
pub struct FakeArtifactStore {
    translations: HashMap<String, String>,
    unresolvable: Vec<String>,
    failing: Vec<String>,
    staged: StagedLog,
}

impl FakeArtifactStore {
    pub fn translating(mut self, alias: &str, build: &str) -> Self {
        self.translations.insert(alias.to_string(), build.to_string());
        self
    }

    pub fn unresolvable(mut self, build: &str) -> Self {
        self.unresolvable.push(build.to_string());
        self
    }

    pub fn failing_stage(mut self, build: &str) -> Self {
        self.failing.push(build.to_string());
        self
    }

    pub fn staged(&self) -> Vec<(String, Vec<ArtifactKind>)> {
        self.staged.borrow().clone()
    }
}

impl ArtifactStore for FakeArtifactStore {
    fn resolve(&self, build: &str) -> Result<Box<dyn ImageServer>> {
        if self.unresolvable.iter().any(|b| b == build) {
            return Err(eyre!("no devserver healthy for {}", build));
        }
        Ok(Box::new(FakeImageServer {
            url: "http://devserver:8082".to_string(),
            fail: self.failing.iter().any(|b| b == build),
            staged: Rc::clone(&self.staged),
        }))
    }

    fn translate(&self, build: &str) -> Result<String> {
        Ok(self.translations.get(build).cloned().unwrap_or_else(|| build.to_string()))
    }
}

struct FakeSuite {
    name: String,
    tests: Vec<(Job, u32)>,
    retries: HashMap<JobId, Job>,
    templates: HashMap<JobId, BugTemplate>,
    suite_job: Option<JobId>,
    schedule_fails: bool,
}

impl Suite for FakeSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&mut self) -> Result<Vec<ScheduledTest>> {
        if self.schedule_fails {
            return Err(eyre!("control file for {} failed to parse", self.name));
        }
        Ok(self
            .tests
            .iter()
            .map(|(job, retries)| ScheduledTest {
                job: job.clone(),
                test_name: job.name.clone(),
                job_retries: *retries,
                bug_template: self.templates.get(&job.id).cloned(),
            })
            .collect())
    }

    fn suite_job_id(&self) -> Option<JobId> {
        self.suite_job
    }

    fn retry(&mut self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.retries.remove(&job_id))
    }
}

/// Hands out suites with a fixed job list, recording the dependencies asked for
pub struct FakeSuiteFactory {
    tests: Vec<(Job, u32)>,
    retries: HashMap<JobId, Job>,
    templates: HashMap<JobId, BugTemplate>,
    suite_job: Option<JobId>,
    schedule_fails: bool,
    created: RefCell<Vec<Vec<String>>>,
}

impl FakeSuiteFactory {
    /// Jobs paired with their retry allowance
    pub fn new(tests: Vec<(Job, u32)>) -> Self {
        Self {
            tests,
            retries: HashMap::new(),
            templates: HashMap::new(),
            suite_job: None,
            schedule_fails: false,
            created: RefCell::new(Vec::new()),
        }
    }

    pub fn with_retry(mut self, job_id: JobId, retry: Job) -> Self {
        self.retries.insert(job_id, retry);
        self
    }

    /// Control-file bug template for the test run by `job_id`
    pub fn with_bug_template(mut self, job_id: JobId, template: BugTemplate) -> Self {
        self.templates.insert(job_id, template);
        self
    }

    pub fn failing_schedule(mut self) -> Self {
        self.schedule_fails = true;
        self
    }

    pub fn with_suite_job(mut self, job_id: JobId) -> Self {
        self.suite_job = Some(job_id);
        self
    }

    pub fn created(&self) -> Vec<Vec<String>> {
        self.created.borrow().clone()
    }
}

impl SuiteFactory for FakeSuiteFactory {
    fn create(&self, spec: &SuiteSpec, dependencies: &[String]) -> Result<Box<dyn Suite>> {
        self.created.borrow_mut().push(dependencies.to_vec());
        Ok(Box::new(FakeSuite {
            name: spec.name.clone(),
            tests: self.tests.clone(),
            retries: self.retries.clone(),
            templates: self.templates.clone(),
            suite_job: self.suite_job,
            schedule_fails: self.schedule_fails,
        }))
    }
}

#[derive(Default)]
pub struct FakeBugReporter {
    filed: RefCell<Vec<(String, BugTemplate)>>,
}

impl FakeBugReporter {
    pub fn filed(&self) -> Vec<String> {
        self.filed.borrow().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn templates(&self) -> Vec<BugTemplate> {
        self.filed.borrow().iter().map(|(_, template)| template.clone()).collect()
    }
}

impl BugReporter for FakeBugReporter {
    fn file_bug(&self, _suite: &str, _build: &str, result: &Status, template: &BugTemplate) -> Result<Option<String>> {
        let mut filed = self.filed.borrow_mut();
        filed.push((result.test_name.clone(), template.clone()));
        Ok(Some(format!("crbug/{}", filed.len())))
    }
}
