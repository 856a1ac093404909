// Scheduling rules: which suite runs on which builds, and how

use crate::branch::{BranchMatcher, MilestoneResolver, check_branch_specs, convert_tot_spec};
use crate::config::Section;
use crate::error::{ConfigError, ResolutionError, SchedulingError};
use crate::services::{Host, HostQuery, JobService, ManifestSource, SuiteRequest, SuiteScheduler, build_name};
use crate::trigger::{Priority, Trigger};
use eyre::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

/// Keys a task section may carry
pub const ALLOWED_KEYS: &[&str] = &[
    "suite",
    "run_on",
    "branch_specs",
    "pool",
    "num",
    "boards",
    "file_bugs",
    "cros_build_spec",
    "firmware_rw_build_spec",
    "test_source",
    "job_retry",
    "hour",
    "day",
];

const RELEASE: &str = "release";
const FIRMWARE: &str = "firmware";

/// Which build supplies the test code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestSource {
    Cros,
    FirmwareRw,
}

impl TestSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TestSource::Cros => "cros",
            TestSource::FirmwareRw => "firmware_rw",
        }
    }
}

impl FromStr for TestSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cros" => Ok(TestSource::Cros),
            "firmware_rw" => Ok(TestSource::FirmwareRw),
            other => Err(format!("unknown test source {}", other)),
        }
    }
}

/// Track a firmware RW companion build is taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareTrack {
    Firmware,
    Cros,
}

impl FirmwareTrack {
    fn build_type(self) -> &'static str {
        match self {
            FirmwareTrack::Firmware => FIRMWARE,
            FirmwareTrack::Cros => RELEASE,
        }
    }
}

impl FromStr for FirmwareTrack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firmware" => Ok(FirmwareTrack::Firmware),
            "cros" => Ok(FirmwareTrack::Cros),
            other => Err(format!("firmware_rw_build_spec must be firmware or cros, got {}", other)),
        }
    }
}

/// The build paired with each matched build, if any.
///
/// `Cros` holds a `tot`, `tot-N` or `Rxx` spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildCrossSpec {
    None,
    Cros(String),
    FirmwareRw(FirmwareTrack),
}

fn is_cros_build_spec(spec: &str) -> bool {
    if spec == "tot" {
        return true;
    }
    let digits = spec.strip_prefix("tot-").or_else(|| spec.strip_prefix('R'));
    digits.is_some_and(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()))
}

/// Whether the caller keeps the rule after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Persistent,
    OneShot,
}

/// One scheduling rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub name: String,
    pub suite: String,
    pub branch_specs: Vec<String>,
    matcher: BranchMatcher,
    pub pool: Option<String>,
    pub num: Option<u32>,
    /// Empty means every board
    pub boards: BTreeSet<String>,
    pub trigger: Trigger,
    pub priority: Priority,
    pub timeout_hours: u32,
    pub file_bugs: bool,
    pub cross: BuildCrossSpec,
    pub test_source: Option<TestSource>,
    pub job_retry: bool,
    pub hour: Option<u32>,
    pub day: Option<u32>,
    pub kind: TaskKind,
}

/// Collaborators a run needs
#[derive(Clone, Copy)]
pub struct TaskEnv<'a> {
    pub scheduler: &'a dyn SuiteScheduler,
    pub manifests: &'a dyn ManifestSource,
    pub milestones: &'a dyn MilestoneResolver,
}

/// What one run did, build by build
#[derive(Debug, Default)]
pub struct RunReport {
    pub scheduled: Vec<String>,
    pub already_scheduled: Vec<String>,
    pub errors: Vec<(String, SchedulingError)>,
    /// Set when the board was skipped as a whole
    pub skipped: Option<String>,
}

fn ranged(section: &Section, key: &str, value: Option<i64>, max: i64, trigger: Trigger, allowed: Trigger) -> Result<Option<u32>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = |reason: String| ConfigError::InvalidValue {
        section: section.name().to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };
    if trigger != allowed {
        return Err(invalid(format!("only valid for {} tasks", allowed)));
    }
    if !(0..=max).contains(&value) {
        return Err(invalid(format!("must be within 0..={}", max)));
    }
    u32::try_from(value).map(Some).map_err(|e| invalid(e.to_string()))
}

impl Task {
    /// Build a rule from a config section.
    ///
    /// Branch specs are resolved against `resolver` here, once.
    pub fn from_config_section(name: &str, section: &Section, resolver: &dyn MilestoneResolver) -> Result<Self, ConfigError> {
        let mut unknown: Vec<String> = section
            .keys()
            .filter(|k| !ALLOWED_KEYS.contains(k))
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(ConfigError::UnknownKeys {
                section: name.to_string(),
                keys: unknown,
            });
        }

        let required = |key: &'static str| -> Result<String, ConfigError> {
            section
                .get_str(key)?
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingKey {
                    section: name.to_string(),
                    key,
                })
        };
        let invalid = |key: &str, value: &str, reason: String| ConfigError::InvalidValue {
            section: name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason,
        };

        let suite = required("suite")?;
        let run_on = required("run_on")?;
        let trigger: Trigger = run_on.parse().map_err(|e| invalid("run_on", &run_on, e))?;

        let branch_specs = section.get_list("branch_specs")?;
        let parsed = check_branch_specs(&branch_specs, resolver)?;

        let num = match section.get_int("num")? {
            Some(n) => Some(u32::try_from(n).map_err(|e| invalid("num", &n.to_string(), e.to_string()))?),
            None => None,
        };

        let cros_spec = section.get_str("cros_build_spec")?;
        let fw_spec = section.get_str("firmware_rw_build_spec")?;
        let cross = match (cros_spec, fw_spec) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingBuildSpecs {
                    section: name.to_string(),
                });
            }
            (Some(spec), None) => {
                if !is_cros_build_spec(&spec) {
                    return Err(invalid("cros_build_spec", &spec, "expected tot, tot-N or Rxx".to_string()));
                }
                BuildCrossSpec::Cros(spec)
            }
            (None, Some(spec)) => {
                BuildCrossSpec::FirmwareRw(spec.parse().map_err(|e| invalid("firmware_rw_build_spec", &spec, e))?)
            }
            (None, None) => BuildCrossSpec::None,
        };

        let test_source = match section.get_str("test_source")? {
            Some(raw) => Some(raw.parse::<TestSource>().map_err(|e| invalid("test_source", &raw, e))?),
            None => None,
        };
        if cross != BuildCrossSpec::None && test_source.is_none() {
            return Err(ConfigError::MissingTestSource {
                section: name.to_string(),
            });
        }

        let hour = ranged(section, "hour", section.get_int("hour")?, 23, trigger, Trigger::Nightly)?;
        let day = ranged(section, "day", section.get_int("day")?, 6, trigger, Trigger::Weekly)?;

        Ok(Task {
            name: name.to_string(),
            suite,
            matcher: BranchMatcher::new(&parsed),
            branch_specs,
            pool: section.get_str("pool")?.filter(|p| !p.is_empty()),
            num,
            boards: section.get_list("boards")?.into_iter().collect(),
            trigger,
            priority: trigger.priority(),
            timeout_hours: trigger.timeout_hours(),
            file_bugs: section.get_bool("file_bugs")?.unwrap_or(false),
            cross,
            test_source,
            job_retry: section.get_bool("job_retry")?.unwrap_or(false),
            hour,
            day,
            kind: TaskKind::Persistent,
        })
    }

    /// The same rule, discarded after its next run
    pub fn one_shot(mut self) -> Self {
        self.kind = TaskKind::OneShot;
        self
    }

    pub fn max_runtime_mins(&self) -> u32 {
        self.timeout_hours * 60
    }

    pub fn fits_spec(&self, branch: &str) -> bool {
        self.matcher.fits(branch)
    }

    fn allows_board(&self, board: &str) -> bool {
        self.boards.is_empty() || self.boards.contains(board)
    }

    /// Hosts this rule could run on for `board`
    pub fn available_hosts(&self, afe: &dyn JobService, board: &str) -> Result<Vec<Host>> {
        if !self.allows_board(board) {
            return Ok(Vec::new());
        }
        let mut labels = vec![format!("board:{}", board)];
        if let Some(pool) = &self.pool {
            labels.push(format!("pool:{}", pool));
        }
        afe.get_hosts(&HostQuery {
            labels,
            ..HostQuery::default()
        })
    }

    /// Schedule the suite for every fitting build; `Ok(true)` keeps the rule.
    ///
    /// Dedup failures are logged per build. A scheduler that cannot be
    /// reached is returned to the caller.
    pub fn run(
        &self,
        env: TaskEnv<'_>,
        branch_builds: &BTreeMap<String, Vec<String>>,
        board: &str,
        force: bool,
    ) -> Result<bool, SchedulingError> {
        let report = self.schedule_matching(env, branch_builds, board, force)?;
        for (build, e) in &report.errors {
            error!(task = %self.name, board, build = %build, error = %e, "Deduping scheduler failed");
        }
        Ok(self.kind == TaskKind::Persistent)
    }

    /// Whether this rule tests firmware builds against a paired CrOS build
    fn is_firmware_task(&self) -> bool {
        self.matcher.has_bare(FIRMWARE)
    }

    pub fn schedule_matching(
        &self,
        env: TaskEnv<'_>,
        branch_builds: &BTreeMap<String, Vec<String>>,
        board: &str,
        force: bool,
    ) -> Result<RunReport, SchedulingError> {
        let mut report = RunReport::default();
        info!(task = %self.name, board, "Running task");

        if !self.allows_board(board) {
            debug!(task = %self.name, board, "Board not in the task's board list");
            report.skipped = Some(format!("board {} not in {:?}", board, self.boards));
            return Ok(report);
        }

        let builds: Vec<(&str, &String)> = branch_builds
            .iter()
            .filter(|(branch, _)| self.fits_spec(branch))
            .flat_map(|(branch, builds)| builds.iter().map(move |b| (branch.as_str(), b)))
            .collect();
        if builds.is_empty() {
            debug!(task = %self.name, board, "No builds fit the branch specs");
            return Ok(report);
        }

        let needs_companion = match self.cross {
            BuildCrossSpec::None => false,
            BuildCrossSpec::Cros(_) => self.is_firmware_task() && builds.iter().any(|(branch, _)| *branch == FIRMWARE),
            BuildCrossSpec::FirmwareRw(_) => true,
        };
        let companion = if needs_companion {
            match self.resolve_companion(env, board) {
                Ok(companion) => Some(companion),
                Err(e) => {
                    warn!(task = %self.name, board, error = %e, "Could not resolve companion build, skipping board");
                    report.skipped = Some(e.to_string());
                    return Ok(report);
                }
            }
        } else {
            None
        };

        for (branch, build) in builds {
            let request = self.request_for(branch, build, companion.as_deref(), board, force);
            match env.scheduler.schedule_suite(&request) {
                Ok(true) => {
                    info!(task = %self.name, suite = %self.suite, build = %build, board, "Scheduled suite");
                    report.scheduled.push(build.clone());
                }
                Ok(false) => {
                    info!(task = %self.name, suite = %self.suite, build = %build, board, "Suite already scheduled");
                    report.already_scheduled.push(build.clone());
                }
                Err(e @ SchedulingError::Dedup(_)) => {
                    warn!(task = %self.name, build = %build, board, error = %e, "Deduping scheduler refused build");
                    report.errors.push((build.clone(), e));
                }
                Err(e @ SchedulingError::Rpc(_)) => {
                    error!(task = %self.name, build = %build, board, error = %e, "Scheduler unreachable");
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Resolved once per run since it depends only on the board
    fn resolve_companion(&self, env: TaskEnv<'_>, board: &str) -> Result<String, ResolutionError> {
        match &self.cross {
            BuildCrossSpec::None => Err(ResolutionError::MalformedSpec("no companion build spec".to_string())),
            BuildCrossSpec::Cros(spec) => {
                let milestone_spec = if spec.starts_with("tot") {
                    convert_tot_spec(spec, env.milestones)?
                } else {
                    spec.clone()
                };
                let milestone = milestone_spec
                    .trim_start_matches('R')
                    .parse::<u32>()
                    .map_err(|_| ResolutionError::MalformedSpec(spec.clone()))?;
                let (m, manifest) = env.manifests.latest_manifest(board, RELEASE, Some(milestone))?;
                Ok(build_name(board, RELEASE, m, &manifest))
            }
            BuildCrossSpec::FirmwareRw(track) => {
                let build_type = track.build_type();
                let (m, manifest) = env.manifests.latest_manifest(board, build_type, None)?;
                Ok(build_name(board, build_type, m, &manifest))
            }
        }
    }

    /// Only builds from the `firmware` branch are paired with a CrOS build
    fn request_for(&self, branch: &str, build: &str, companion: Option<&str>, board: &str, force: bool) -> SuiteRequest {
        let (cros_build, firmware_rw_build) = match (&self.cross, companion) {
            (BuildCrossSpec::Cros(_), Some(cros)) if branch == FIRMWARE => (cros.to_string(), Some(build.to_string())),
            (BuildCrossSpec::FirmwareRw(_), Some(fw)) => (build.to_string(), Some(fw.to_string())),
            _ => (build.to_string(), None),
        };
        let test_source_build = match self.test_source {
            Some(TestSource::Cros) => Some(cros_build.clone()),
            Some(TestSource::FirmwareRw) => firmware_rw_build.clone(),
            None => None,
        };
        SuiteRequest {
            suite: self.suite.clone(),
            board: board.to_string(),
            cros_build,
            pool: self.pool.clone(),
            num: self.num,
            priority: self.priority,
            timeout_hours: self.timeout_hours,
            force,
            file_bugs: self.file_bugs,
            firmware_rw_build,
            test_source_build,
            job_retry: self.job_retry,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let specs = if self.branch_specs.is_empty() {
            "any branch".to_string()
        } else {
            self.branch_specs.join(",")
        };
        let boards: Vec<&str> = self.boards.iter().map(String::as_str).collect();
        write!(
            f,
            "{}: {} on {} with pool {}, boards [{}], file_bugs = {} across {} machines.",
            self.name,
            self.suite,
            specs,
            self.pool.as_deref().unwrap_or("None"),
            boards.join(","),
            self.file_bugs,
            self.num.map_or_else(|| "default".to_string(), |n| n.to_string()),
        )
    }
}
