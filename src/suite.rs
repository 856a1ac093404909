// Suite runs: validate, stage, schedule and wait for results

use crate::error::SuiteError;
use crate::job_status::{DEFAULT_ABORT_THRESHOLD, RESULTS_POLL_INTERVAL, ResultPoller, check_job_abort_status};
use crate::retry::RetryHandler;
use crate::services::{ArtifactKind, ArtifactStore, Job, JobId, JobService, ResultStore, SuiteRequest};
use crate::status::{Status, StatusCode, StatusRecorder};
use crate::task::TestSource;
use crate::trigger::Priority;
use eyre::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CROS_VERSION_PREFIX: &str = "cros-version:";
pub const FW_RW_VERSION_PREFIX: &str = "fwrw-version:";
pub const FW_RO_VERSION_PREFIX: &str = "fwro-version:";

/// Name prefix marking a test whose failures are not filed by default
pub const EXPERIMENTAL_PREFIX: &str = "experimental_";

/// Artifacts that must be staged before control files can be read
const TEST_SOURCE_ARTIFACTS: &[ArtifactKind] = &[ArtifactKind::ControlFiles, ArtifactKind::TestSuites];

/// Control file metadata a predicate looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub name: String,
    /// Values of the control file's SUITE attribute
    pub suites: Vec<String>,
}

/// Selects the tests that make up a suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuitePredicate {
    /// Tests tagged with the suite name
    NameInTag(String),
    /// A single test by name
    TestNameEquals(String),
}

impl SuitePredicate {
    pub fn matches(&self, control: &ControlInfo) -> bool {
        match self {
            SuitePredicate::NameInTag(tag) => control.suites.iter().any(|s| s == tag),
            SuitePredicate::TestNameEquals(name) => control.name == *name,
        }
    }
}

/// Default bug fields for failures, set per suite and per test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BugTemplate {
    pub owner: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub components: Vec<String>,
    pub labels: Vec<String>,
    pub cc: Vec<String>,
}

impl BugTemplate {
    /// Test fields win over suite fields; labels and cc are combined
    pub fn merged_with(&self, test: Option<&BugTemplate>) -> BugTemplate {
        let Some(test) = test else {
            return self.clone();
        };
        let union = |a: &[String], b: &[String]| -> Vec<String> {
            let mut all: Vec<String> = a.iter().chain(b).cloned().collect();
            all.sort();
            all.dedup();
            all
        };
        BugTemplate {
            owner: test.owner.clone().or_else(|| self.owner.clone()),
            status: test.status.clone().or_else(|| self.status.clone()),
            summary: test.summary.clone().or_else(|| self.summary.clone()),
            components: if test.components.is_empty() {
                self.components.clone()
            } else {
                test.components.clone()
            },
            labels: union(&test.labels, &self.labels),
            cc: union(&test.cc, &self.cc),
        }
    }
}

/// Raw suite request, before validation
#[derive(Debug, Clone)]
pub struct SuiteArgs {
    /// Legacy single CrOS build
    pub build: Option<String>,
    /// Version prefix to build
    pub builds: BTreeMap<String, String>,
    pub board: String,
    pub name: String,
    pub pool: Option<String>,
    pub num: Option<u32>,
    pub priority: Priority,
    pub timeout_mins: u64,
    pub max_runtime_mins: u64,
    pub wait_for_results: bool,
    pub file_bugs: bool,
    pub file_experimental_bugs: bool,
    pub bug_template: BugTemplate,
    pub job_retry: bool,
    pub max_retries: Option<u32>,
    pub retry_level: StatusCode,
    pub test_source: Option<TestSource>,
    pub test_source_build: Option<String>,
    pub suite_dependencies: Vec<String>,
    pub predicate: Option<SuitePredicate>,
}

impl Default for SuiteArgs {
    fn default() -> Self {
        Self {
            build: None,
            builds: BTreeMap::new(),
            board: String::new(),
            name: String::new(),
            pool: None,
            num: None,
            priority: Priority::Default,
            timeout_mins: 24 * 60,
            max_runtime_mins: 24 * 60,
            wait_for_results: true,
            file_bugs: false,
            file_experimental_bugs: false,
            bug_template: BugTemplate::default(),
            job_retry: false,
            max_retries: None,
            retry_level: StatusCode::Warn,
            test_source: None,
            test_source_build: None,
            suite_dependencies: Vec::new(),
            predicate: None,
        }
    }
}

impl From<&SuiteRequest> for SuiteArgs {
    fn from(request: &SuiteRequest) -> Self {
        let mut builds = BTreeMap::new();
        builds.insert(CROS_VERSION_PREFIX.to_string(), request.cros_build.clone());
        if let Some(fw) = &request.firmware_rw_build {
            builds.insert(FW_RW_VERSION_PREFIX.to_string(), fw.clone());
        }
        let timeout_mins = u64::from(request.timeout_hours) * 60;
        Self {
            builds,
            board: request.board.clone(),
            name: request.suite.clone(),
            pool: request.pool.clone(),
            num: request.num,
            priority: request.priority,
            timeout_mins,
            max_runtime_mins: timeout_mins,
            wait_for_results: false,
            file_bugs: request.file_bugs,
            job_retry: request.job_retry,
            test_source_build: request.test_source_build.clone(),
            ..Self::default()
        }
    }
}

/// A validated suite request
#[derive(Debug, Clone)]
pub struct SuiteSpec {
    pub builds: BTreeMap<String, String>,
    pub board: String,
    pub name: String,
    pub pool: Option<String>,
    pub num: Option<u32>,
    pub priority: Priority,
    pub timeout_mins: u64,
    pub max_runtime_mins: u64,
    pub wait_for_results: bool,
    pub file_bugs: bool,
    pub file_experimental_bugs: bool,
    pub bug_template: BugTemplate,
    pub job_retry: bool,
    pub max_retries: Option<u32>,
    pub retry_level: StatusCode,
    /// The build whose control files define the tests
    pub test_source_build: String,
    pub suite_dependencies: Vec<String>,
    pub predicate: SuitePredicate,
}

fn argument_error(msg: impl Into<String>) -> SuiteError {
    SuiteError::SuiteArgument(msg.into())
}

impl SuiteSpec {
    pub fn new(args: SuiteArgs) -> Result<Self, SuiteError> {
        let mut builds = args.builds;
        let cros = builds.get(CROS_VERSION_PREFIX).cloned();
        match (args.build, cros) {
            (Some(build), Some(cros)) if build != cros => {
                return Err(argument_error(format!(
                    "build {} and builds[{}] {} disagree",
                    build, CROS_VERSION_PREFIX, cros
                )));
            }
            (Some(build), None) => {
                builds.insert(CROS_VERSION_PREFIX.to_string(), build);
            }
            _ => {}
        }
        if builds.is_empty() {
            return Err(argument_error("either build or builds is required"));
        }
        if builds.contains_key(FW_RO_VERSION_PREFIX) {
            return Err(argument_error("firmware RO provisioning is not supported"));
        }
        if args.board.trim().is_empty() {
            return Err(argument_error("board is required"));
        }
        if args.name.trim().is_empty() {
            return Err(argument_error("suite name is required"));
        }

        let test_source_build = match args.test_source_build {
            Some(build) => build,
            None => {
                let prefix = match args.test_source {
                    Some(TestSource::FirmwareRw) => FW_RW_VERSION_PREFIX,
                    Some(TestSource::Cros) | None => CROS_VERSION_PREFIX,
                };
                builds
                    .get(prefix)
                    .cloned()
                    .ok_or_else(|| argument_error(format!("no {} build to source tests from", prefix)))?
            }
        };

        let predicate = args
            .predicate
            .unwrap_or_else(|| SuitePredicate::NameInTag(args.name.clone()));

        Ok(Self {
            builds,
            board: args.board,
            name: args.name,
            pool: args.pool,
            num: args.num,
            priority: args.priority,
            timeout_mins: args.timeout_mins,
            max_runtime_mins: args.max_runtime_mins,
            wait_for_results: args.wait_for_results,
            file_bugs: args.file_bugs,
            file_experimental_bugs: args.file_experimental_bugs,
            bug_template: args.bug_template,
            job_retry: args.job_retry,
            max_retries: args.max_retries,
            retry_level: args.retry_level,
            test_source_build,
            suite_dependencies: args.suite_dependencies,
            predicate,
        })
    }

    pub fn cros_build(&self) -> Option<&str> {
        self.builds.get(CROS_VERSION_PREFIX).map(String::as_str)
    }
}

/// One test job a suite created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTest {
    pub job: Job,
    pub test_name: String,
    /// Retries the test's control file allows
    pub job_retries: u32,
    /// From the test's control file
    pub bug_template: Option<BugTemplate>,
}

/// A set of tests selected by a predicate and run as one unit
pub trait Suite {
    fn name(&self) -> &str;

    /// Create the test jobs
    fn schedule(&mut self) -> Result<Vec<ScheduledTest>>;

    /// Parent job id when the tests run as children of a suite job
    fn suite_job_id(&self) -> Option<JobId>;

    /// Re-create the test that `job_id` ran; `None` when it cannot be retried
    fn retry(&mut self, job_id: JobId) -> Result<Option<Job>>;
}

pub trait SuiteFactory {
    /// `dependencies` already pins every job to the builds under test
    fn create(&self, spec: &SuiteSpec, dependencies: &[String]) -> Result<Box<dyn Suite>>;
}

pub trait BugReporter {
    /// Returns the bug id, if one was filed
    fn file_bug(&self, suite: &str, build: &str, result: &Status, template: &BugTemplate) -> Result<Option<String>>;
}

/// Collaborators of a suite run
pub struct SuiteEnv<'a> {
    pub afe: &'a dyn JobService,
    pub tko: &'a dyn ResultStore,
    pub artifacts: &'a dyn ArtifactStore,
    pub factory: &'a dyn SuiteFactory,
    pub bugs: Option<&'a dyn BugReporter>,
    pub abort_threshold: f64,
    pub results_interval: Duration,
}

impl<'a> SuiteEnv<'a> {
    pub fn new(
        afe: &'a dyn JobService,
        tko: &'a dyn ResultStore,
        artifacts: &'a dyn ArtifactStore,
        factory: &'a dyn SuiteFactory,
    ) -> Self {
        Self {
            afe,
            tko,
            artifacts,
            factory,
            bugs: None,
            abort_threshold: DEFAULT_ABORT_THRESHOLD,
            results_interval: RESULTS_POLL_INTERVAL,
        }
    }

    pub fn with_bug_reporter(mut self, bugs: &'a dyn BugReporter) -> Self {
        self.bugs = Some(bugs);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SuiteOutcome {
    pub scheduled: usize,
    pub results: Vec<Status>,
    /// Absent when the caller did not wait
    pub suite_status: Option<Status>,
    pub bugs: Vec<String>,
}

fn stage_test_source(artifacts: &dyn ArtifactStore, build: &str) -> Result<(), SuiteError> {
    let server = artifacts.resolve(build).map_err(|e| SuiteError::StageControlFileFailure {
        build: build.to_string(),
        devserver: "<unresolved>".to_string(),
        reason: format!("{:#}", e),
    })?;
    info!(build, devserver = server.url(), "Staging test source artifacts");
    server
        .stage_artifacts(build, TEST_SOURCE_ARTIFACTS)
        .map_err(|e| SuiteError::AsynchronousBuildFailure {
            build: build.to_string(),
            reason: format!("{:#}", e),
        })
}

fn is_experimental(result: &Status) -> bool {
    result.test_name.contains(EXPERIMENTAL_PREFIX) || result.job_name.contains(EXPERIMENTAL_PREFIX)
}

/// Worth a bug: a test that ran, went bad, and will not be retried
fn should_report(spec: &SuiteSpec, retries: &RetryHandler, result: &Status) -> bool {
    let good = Status::new(StatusCode::Good, "").with_reason("reason");
    spec.file_bugs
        && result.test_executed
        && (spec.file_experimental_bugs || !is_experimental(result))
        && !result.is_testna()
        && result.is_worse_than(&good)
        && !retries.has_following_retry(result)
}

/// Stage, schedule and (optionally) wait for one suite.
///
/// Staging failures come back as [`SuiteError`] inside the report. Failures
/// while scheduling or waiting are recorded as a FAIL suite status instead.
pub fn reimage_and_run(spec: &SuiteSpec, env: &SuiteEnv<'_>, recorder: &mut dyn StatusRecorder) -> Result<SuiteOutcome> {
    let mut builds = BTreeMap::new();
    for (prefix, build) in &spec.builds {
        let translated = env
            .artifacts
            .translate(build)
            .context(format!("Failed to translate build {}", build))?;
        if translated != *build {
            debug!(build = %build, translated = %translated, "Translated build");
        }
        builds.insert(prefix.clone(), translated);
    }
    let test_source_build = env
        .artifacts
        .translate(&spec.test_source_build)
        .context(format!("Failed to translate build {}", spec.test_source_build))?;

    stage_test_source(env.artifacts, &test_source_build)?;

    let mut dependencies = spec.suite_dependencies.clone();
    dependencies.extend(builds.iter().map(|(prefix, build)| format!("{}{}", prefix, build)));

    let mut suite = env.factory.create(spec, &dependencies)?;
    Status::new(StatusCode::Info, format!("Start {}", suite.name())).record_result(recorder)?;

    let mut outcome = SuiteOutcome {
        scheduled: 0,
        results: Vec::new(),
        suite_status: None,
        bugs: Vec::new(),
    };
    let scheduled = match suite.schedule() {
        Ok(scheduled) => scheduled,
        Err(e) => {
            error!(suite = suite.name(), board = %spec.board, error = %format!("{:#}", e), "Failed to schedule suite");
            let failure = Status::new(StatusCode::Fail, suite.name()).with_reason("Exception while scheduling suite");
            failure.record_result(recorder)?;
            outcome.suite_status = Some(failure);
            return Ok(outcome);
        }
    };
    outcome.scheduled = scheduled.len();
    info!(suite = suite.name(), board = %spec.board, jobs = scheduled.len(), "Scheduled suite");

    if !spec.wait_for_results {
        return Ok(outcome);
    }

    let allowances = scheduled
        .iter()
        .map(|t| (t.job.id, if spec.job_retry { t.job_retries } else { 0 }));
    let mut run = SuiteRun {
        retries: RetryHandler::new(allowances, spec.retry_level, spec.max_retries),
        all_jobs: scheduled.iter().map(|t| t.job.clone()).collect(),
        templates: scheduled
            .iter()
            .map(|t| (t.job.id, spec.bug_template.merged_with(t.bug_template.as_ref())))
            .collect(),
        build_label: builds
            .get(CROS_VERSION_PREFIX)
            .cloned()
            .unwrap_or_else(|| test_source_build.clone()),
    };

    if let Err(e) = run.wait(spec, env, suite.as_mut(), recorder, &mut outcome) {
        error!(suite = suite.name(), error = %format!("{:#}", e), "Failed while waiting for results");
        let failure = Status::new(StatusCode::Fail, suite.name()).with_reason("Exception waiting for results");
        failure.record_result(recorder)?;
        outcome.suite_status = Some(failure);
        return Ok(outcome);
    }

    let too_many_aborts = check_job_abort_status(env.afe, &run.all_jobs, env.abort_threshold)?;
    let failed = outcome
        .results
        .iter()
        .filter(|r| !run.retries.has_following_retry(r))
        .any(|r| r.code.is_worse_than(StatusCode::Warn));

    let suite_status = if too_many_aborts {
        Status::new(StatusCode::Abort, suite.name()).with_reason("Too many aborted host queue entries")
    } else if failed {
        Status::new(StatusCode::Fail, suite.name())
    } else {
        Status::new(StatusCode::Good, suite.name())
    };
    suite_status.record_all(recorder)?;
    info!(suite = suite.name(), status = %suite_status.code, results = outcome.results.len(), "Suite finished");

    outcome.suite_status = Some(suite_status);
    Ok(outcome)
}

/// Bookkeeping while results stream in
struct SuiteRun {
    retries: RetryHandler,
    all_jobs: Vec<Job>,
    /// Merged bug template per job, retries included
    templates: HashMap<JobId, BugTemplate>,
    build_label: String,
}

impl SuiteRun {
    fn wait(
        &mut self,
        spec: &SuiteSpec,
        env: &SuiteEnv<'_>,
        suite: &mut dyn Suite,
        recorder: &mut dyn StatusRecorder,
        outcome: &mut SuiteOutcome,
    ) -> Result<()> {
        let poller = match suite.suite_job_id() {
            Some(parent) => ResultPoller::for_children(env.afe, env.tko, parent)?,
            None => ResultPoller::for_jobs(env.afe, env.tko, self.all_jobs.clone()),
        };
        let mut poller = poller.with_interval(env.results_interval);

        while let Some(result) = poller.next() {
            let status = result?;
            status.record_all(recorder)?;

            if let Some(job_id) = status.job_id {
                if self.retries.should_retry(&status) {
                    match suite.retry(job_id)? {
                        Some(job) => {
                            info!(old_job_id = job_id, new_job_id = job.id, test = %status.test_name, "Retrying test");
                            self.retries.add_retry(job_id, job.id)?;
                            if let Some(template) = self.templates.get(&job_id).cloned() {
                                self.templates.insert(job.id, template);
                            }
                            self.all_jobs.push(job.clone());
                            poller.add_jobs([job]);
                        }
                        None => {
                            warn!(job_id, test = %status.test_name, "Could not schedule retry");
                            self.retries.set_attempted(job_id)?;
                        }
                    }
                }
            }

            if should_report(spec, &self.retries, &status) {
                if let Some(bugs) = env.bugs {
                    let template = status
                        .job_id
                        .and_then(|id| self.templates.get(&id))
                        .unwrap_or(&spec.bug_template);
                    match bugs.file_bug(&spec.name, &self.build_label, &status, template) {
                        Ok(Some(id)) => outcome.bugs.push(id),
                        Ok(None) => {}
                        Err(e) => error!(test = %status.test_name, error = %e, "Failed to file bug"),
                    }
                }
            }
            outcome.results.push(status);
        }
        Ok(())
    }
}
