// Test result records and the status log they are recorded into

use crate::services::{Job, JobId};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Timestamp format used by the result store
pub const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Test names the infrastructure uses for the job itself rather than a test
pub const SERVER_JOB: &str = "SERVER_JOB";
pub const CLIENT_JOB: &str = "CLIENT_JOB";

/// Outcome of one test, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "TEST_NA")]
    TestNa,
    #[serde(rename = "ABORT")]
    Abort,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "GOOD")]
    Good,
    #[serde(rename = "INFO")]
    Info,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::TestNa => "TEST_NA",
            StatusCode::Abort => "ABORT",
            StatusCode::Error => "ERROR",
            StatusCode::Fail => "FAIL",
            StatusCode::Warn => "WARN",
            StatusCode::Good => "GOOD",
            StatusCode::Info => "INFO",
        }
    }

    /// Severity rank; lower is worse
    pub fn rank(self) -> u8 {
        match self {
            StatusCode::TestNa => 0,
            StatusCode::Abort => 1,
            StatusCode::Error => 2,
            StatusCode::Fail => 3,
            StatusCode::Warn => 4,
            StatusCode::Good => 5,
            StatusCode::Info => 6,
        }
    }

    pub fn is_worse_than(self, other: StatusCode) -> bool {
        self.rank() < other.rank()
    }
}

impl FromStr for StatusCode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEST_NA" => Ok(StatusCode::TestNa),
            "ABORT" => Ok(StatusCode::Abort),
            "ERROR" => Ok(StatusCode::Error),
            "FAIL" => Ok(StatusCode::Fail),
            "WARN" => Ok(StatusCode::Warn),
            "GOOD" => Ok(StatusCode::Good),
            "INFO" => Ok(StatusCode::Info),
            other => Err(eyre!("Unknown status code: {}", other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One observed test (or infrastructure job) outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub test_name: String,
    pub reason: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// True only when the job record carried a start time
    pub test_executed: bool,
    pub job_id: Option<JobId>,
    pub owner: Option<String>,
    pub hostname: Option<String>,
    pub job_name: String,
    pub subdir: Option<String>,
}

impl Status {
    pub fn new(code: StatusCode, test_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            code,
            test_name: test_name.into(),
            reason: String::new(),
            begin: now,
            end: now,
            test_executed: false,
            job_id: None,
            owner: None,
            hostname: None,
            job_name: String::new(),
            subdir: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Apply result-store timestamps; a missing begin means the test never ran.
    ///
    /// An unparseable timestamp still counts as supplied and falls back to now.
    pub fn with_times(mut self, begin: Option<&str>, end: Option<&str>) -> Self {
        let now = Utc::now();
        let begin = begin.filter(|raw| is_supplied(raw));
        self.test_executed = begin.is_some();
        self.begin = begin.and_then(|raw| parse_time(&self.test_name, raw)).unwrap_or(now);
        self.end = end
            .filter(|raw| is_supplied(raw))
            .and_then(|raw| parse_time(&self.test_name, raw))
            .unwrap_or(now);
        self
    }

    pub fn with_job(mut self, job: &Job) -> Self {
        self.job_id = Some(job.id);
        self.owner = Some(job.owner.clone());
        self.job_name = job.name.clone();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        self.hostname = if hostname.is_empty() { None } else { Some(hostname) };
        self
    }

    pub fn with_subdir(mut self, subdir: Option<String>) -> Self {
        self.subdir = subdir;
        self
    }

    /// Same record under a different code
    pub fn demoted(mut self, code: StatusCode) -> Self {
        self.code = code;
        self
    }

    pub fn is_good(&self) -> bool {
        self.code == StatusCode::Good
    }

    pub fn is_warn(&self) -> bool {
        self.code == StatusCode::Warn
    }

    pub fn is_testna(&self) -> bool {
        self.code == StatusCode::TestNa
    }

    /// Worse by severity; on equal codes a status with a reason is worse
    pub fn is_worse_than(&self, other: &Status) -> bool {
        if self.code == other.code {
            return !self.reason.is_empty() && other.reason.is_empty();
        }
        self.code.is_worse_than(other.code)
    }

    pub fn record_start(&self, recorder: &mut dyn StatusRecorder) -> Result<()> {
        recorder.record(self.entry("START".to_string(), None, String::new(), self.begin))
    }

    pub fn record_result(&self, recorder: &mut dyn StatusRecorder) -> Result<()> {
        recorder.record(self.entry(
            self.code.as_str().to_string(),
            self.subdir.clone(),
            self.reason.clone(),
            self.end,
        ))
    }

    pub fn record_end(&self, recorder: &mut dyn StatusRecorder) -> Result<()> {
        recorder.record(self.entry(
            format!("END {}", self.code),
            self.subdir.clone(),
            String::new(),
            self.end,
        ))
    }

    /// Start, result and end, in that order
    pub fn record_all(&self, recorder: &mut dyn StatusRecorder) -> Result<()> {
        self.record_start(recorder)?;
        self.record_result(recorder)?;
        self.record_end(recorder)
    }

    fn entry(&self, status_code: String, subdir: Option<String>, message: String, at: DateTime<Utc>) -> StatusLogEntry {
        StatusLogEntry {
            id: uuid::Uuid::now_v7().to_string(),
            status_code,
            subdir,
            operation: self.test_name.clone(),
            message,
            timestamp: at.timestamp(),
            job_id: self.job_id,
            hostname: self.hostname.clone(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.test_name)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

fn is_supplied(raw: &str) -> bool {
    let raw = raw.trim();
    !raw.is_empty() && raw != "None"
}

fn parse_time(test_name: &str, raw: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(raw.trim(), TIME_FMT) {
        Ok(naive) => Some(Utc.from_utc_datetime(&naive)),
        Err(e) => {
            warn!(test = test_name, raw, error = %e, "Malformed result timestamp, using now");
            None
        }
    }
}

/// Whether a status describes the job harness rather than a test
pub fn is_for_infrastructure_fail(status: &Status) -> bool {
    status.test_name.contains(SERVER_JOB) || status.test_name.contains(CLIENT_JOB)
}

/// One line of a status log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: String,
    /// `START`, a status code, or `END <code>`
    pub status_code: String,
    pub subdir: Option<String>,
    /// Test name
    pub operation: String,
    pub message: String,
    /// Seconds since epoch
    pub timestamp: i64,
    pub job_id: Option<JobId>,
    pub hostname: Option<String>,
}

impl StatusLogEntry {
    /// Tab-separated log line
    pub fn render(&self) -> String {
        let localtime = Utc
            .timestamp_opt(self.timestamp, 0)
            .single()
            .map(|t| t.format("%b %d %H:%M:%S").to_string())
            .unwrap_or_default();
        let mut fields = vec![
            self.status_code.clone(),
            self.subdir.clone().unwrap_or_else(|| "----".to_string()),
            if self.operation.is_empty() {
                "----".to_string()
            } else {
                self.operation.clone()
            },
            format!("timestamp={}", self.timestamp),
            format!("localtime={}", localtime),
        ];
        // Tabs and newlines would break the line format.
        fields.push(self.message.replace(['\t', '\n'], " "));
        fields.join("\t")
    }
}

/// Sink for status log entries
pub trait StatusRecorder {
    fn record(&mut self, entry: StatusLogEntry) -> Result<()>;
}

impl StatusRecorder for Vec<StatusLogEntry> {
    fn record(&mut self, entry: StatusLogEntry) -> Result<()> {
        self.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_is_worse_than_warn_regardless_of_reason() {
        let fail = Status::new(StatusCode::Fail, "T0");
        let warn = Status::new(StatusCode::Warn, "T0").with_reason("flaky");
        assert!(fail.is_worse_than(&warn));
        assert!(!warn.is_worse_than(&fail));
    }

    #[test]
    fn test_reason_breaks_ties() {
        let with_reason = Status::new(StatusCode::Fail, "T0").with_reason("reasonA");
        let without = Status::new(StatusCode::Fail, "T0");
        assert!(with_reason.is_worse_than(&without));
        assert!(!without.is_worse_than(&with_reason));
        assert!(!without.is_worse_than(&without.clone()));
    }

    #[test]
    fn test_severity_ranking() {
        use StatusCode::*;
        let ordered = [TestNa, Abort, Error, Fail, Warn, Good];
        for pair in ordered.windows(2) {
            assert!(pair[0].is_worse_than(pair[1]), "{} vs {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_facets() {
        assert!(Status::new(StatusCode::Good, "t").is_good());
        assert!(Status::new(StatusCode::Warn, "t").is_warn());
        assert!(Status::new(StatusCode::TestNa, "t").is_testna());
    }

    #[test]
    fn test_executed_only_with_begin_time() {
        let ran = Status::new(StatusCode::Good, "t").with_times(Some("2014-03-01 10:00:00"), Some("2014-03-01 10:00:00"));
        assert!(ran.test_executed);
        assert_eq!(ran.begin, ran.end);
        assert_eq!(ran.begin.timestamp(), 1393668000);

        let never = Status::new(StatusCode::Abort, "t").with_times(None, Some("2014-03-01 10:00:00"));
        assert!(!never.test_executed);

        let literal_none = Status::new(StatusCode::Abort, "t").with_times(Some("None"), None);
        assert!(!literal_none.test_executed);
    }

    #[test]
    fn test_malformed_begin_still_counts_as_executed() {
        let before = Utc::now();
        let status = Status::new(StatusCode::Fail, "t").with_times(Some("2014-03-01T10:00:00"), Some("garbage"));
        assert!(status.test_executed);
        assert!(status.begin >= before);
        assert!(status.end >= before);

        let blank = Status::new(StatusCode::Fail, "t").with_times(Some("  "), None);
        assert!(!blank.test_executed);
    }

    #[test]
    fn test_record_all_emits_three_entries() {
        let status = Status::new(StatusCode::Fail, "dummy_Fail")
            .with_reason("boom")
            .with_subdir(Some("dummy_Fail".to_string()));
        let mut log: Vec<StatusLogEntry> = Vec::new();
        status.record_all(&mut log).unwrap();

        let codes: Vec<&str> = log.iter().map(|e| e.status_code.as_str()).collect();
        assert_eq!(codes, vec!["START", "FAIL", "END FAIL"]);
        assert!(log[0].subdir.is_none());
        assert_eq!(log[1].message, "boom");
        assert_eq!(log[2].subdir.as_deref(), Some("dummy_Fail"));
        assert!(log.iter().all(|e| e.operation == "dummy_Fail"));
    }

    #[test]
    fn test_render_line() {
        let entry = StatusLogEntry {
            id: "x".to_string(),
            status_code: "FAIL".to_string(),
            subdir: None,
            operation: "dummy_Fail".to_string(),
            message: "bad\tthing".to_string(),
            timestamp: 1393668000,
            job_id: Some(7),
            hostname: None,
        };
        let line = entry.render();
        assert!(line.starts_with("FAIL\t----\tdummy_Fail\ttimestamp=1393668000\t"));
        assert!(line.ends_with("bad thing"));
    }

    #[test]
    fn test_infrastructure_names() {
        assert!(is_for_infrastructure_fail(&Status::new(StatusCode::Fail, "suite_SERVER_JOB")));
        assert!(is_for_infrastructure_fail(&Status::new(StatusCode::Fail, "job_CLIENT_JOB.0")));
        assert!(!is_for_infrastructure_fail(&Status::new(StatusCode::Fail, "dummy_Pass")));
    }

    #[test]
    fn test_status_code_round_trip_strings() {
        for code in ["TEST_NA", "ABORT", "ERROR", "FAIL", "WARN", "GOOD", "INFO"] {
            assert_eq!(code.parse::<StatusCode>().unwrap().as_str(), code);
        }
        assert!("NOSTATUS".parse::<StatusCode>().is_err());
    }
}
