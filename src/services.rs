// Contracts for the lab services this crate drives
//
// Transports live elsewhere; everything here is what the scheduling core
// needs from them and nothing more.

use crate::error::{ResolutionError, SchedulingError};
use crate::trigger::Priority;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type JobId = i64;

/// A job known to the job service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub name: String,
    pub parent_job_id: Option<JobId>,
}

impl Job {
    /// Results directory tag (`<id>-<owner>`)
    pub fn tag(&self) -> String {
        format!("{}-{}", self.id, self.owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub status: String,
    pub labels: Vec<String>,
    pub locked: bool,
}

/// Links one job to one (possibly not yet assigned) machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueueEntry {
    pub job_id: JobId,
    pub status: String,
    pub host: Option<Host>,
    pub aborted: bool,
}

impl HostQueueEntry {
    pub fn hostname(&self) -> Option<&str> {
        self.host.as_ref().map(|h| h.hostname.as_str())
    }
}

/// Job lookup filter; unset fields don't filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub ids: Vec<JobId>,
    pub parent_job_id: Option<JobId>,
    pub finished: Option<bool>,
    pub not_yet_run: Option<bool>,
}

impl JobQuery {
    pub fn id(id: JobId) -> Self {
        Self {
            ids: vec![id],
            ..Self::default()
        }
    }

    pub fn children_of(parent: JobId) -> Self {
        Self {
            parent_job_id: Some(parent),
            ..Self::default()
        }
    }

    pub fn finished(mut self) -> Self {
        self.finished = Some(true);
        self
    }

    pub fn not_yet_run(mut self) -> Self {
        self.not_yet_run = Some(true);
        self
    }
}

/// Host lookup filter; unset fields don't filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostQuery {
    pub hostnames: Vec<String>,
    pub status: Option<String>,
    /// Hosts must carry every label listed
    pub labels: Vec<String>,
}

/// The job-management frontend
pub trait JobService {
    fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;
    fn get_host_queue_entries(&self, job_id: JobId) -> Result<Vec<HostQueueEntry>>;
    fn get_hosts(&self, query: &HostQuery) -> Result<Vec<Host>>;
    fn abort_host_queue_entries(&self, job_id: JobId) -> Result<()>;
}

/// Per-test row from the result store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatus {
    pub status: String,
    pub test_name: String,
    pub reason: String,
    pub test_started_time: Option<String>,
    pub test_finished_time: Option<String>,
    pub hostname: String,
    pub job_tag: String,
    pub subdir: Option<String>,
}

/// The test-result database
pub trait ResultStore {
    fn get_job_test_statuses(&self, job_id: JobId) -> Result<Vec<TestStatus>>;
}

/// Claims hosts so nothing else reimages them
pub trait HostLockManager {
    fn lock(&self, hostnames: &[String]) -> Result<()>;
}

/// Artifacts a devserver can stage for a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ControlFiles,
    TestSuites,
    AutotestPackages,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::ControlFiles => "control_files",
            ArtifactKind::TestSuites => "test_suites",
            ArtifactKind::AutotestPackages => "autotest_packages",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A devserver chosen to serve one build
pub trait ImageServer {
    fn url(&self) -> &str;
    fn stage_artifacts(&self, build: &str, artifacts: &[ArtifactKind]) -> Result<()>;
}

/// Picks devservers and canonicalises build names
pub trait ArtifactStore {
    fn resolve(&self, build: &str) -> Result<Box<dyn ImageServer>>;
    /// Expand aliases such as `board-release/LATEST` into a concrete build
    fn translate(&self, build: &str) -> Result<String>;
}

/// Latest builds per board and build type
pub trait ManifestSource {
    /// `(milestone, manifest)` of the newest build, optionally within a milestone
    fn latest_manifest(
        &self,
        board: &str,
        build_type: &str,
        milestone: Option<u32>,
    ) -> Result<(u32, String), ResolutionError>;
}

/// `<board>-<type>/R<milestone>-<manifest>`
pub fn build_name(board: &str, build_type: &str, milestone: u32, manifest: &str) -> String {
    format!("{}-{}/R{}-{}", board, build_type, milestone, manifest)
}

/// Everything a scheduler needs to create one suite job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteRequest {
    pub suite: String,
    pub board: String,
    pub cros_build: String,
    pub pool: Option<String>,
    pub num: Option<u32>,
    pub priority: Priority,
    pub timeout_hours: u32,
    pub force: bool,
    pub file_bugs: bool,
    pub firmware_rw_build: Option<String>,
    pub test_source_build: Option<String>,
    pub job_retry: bool,
}

/// Creates suite jobs, refusing duplicates
pub trait SuiteScheduler {
    /// `Ok(false)` when an identical suite is already scheduled
    fn schedule_suite(&self, request: &SuiteRequest) -> Result<bool, SchedulingError>;
}
