// Task rule files and scheduler settings

use crate::branch::MilestoneResolver;
use crate::error::ConfigError;
use crate::job_status::{DEFAULT_ABORT_THRESHOLD, DEFAULT_POLL_INTERVAL, RESULTS_POLL_INTERVAL, WaitOptions};
use crate::task::Task;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One named section of a task file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    name: String,
    values: BTreeMap<String, Value>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn invalid(&self, key: &str, value: &Value, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.name.clone(),
            key: key.to_string(),
            value: render(value),
            reason: reason.to_string(),
        }
    }

    /// Scalar as a string; numbers and booleans are stringified
    pub fn get_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(self.invalid(key, other, "expected a scalar")),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v @ Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, v, "expected an integer")),
            Some(v @ Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| self.invalid(key, v, "expected an integer")),
            Some(other) => Err(self.invalid(key, other, "expected an integer")),
        }
    }

    /// Booleans accept `1/yes/true/on` and `0/no/false/off`
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(v @ Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(self.invalid(key, v, "expected a boolean")),
            },
            Some(v @ Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => Ok(Some(true)),
                "0" | "no" | "false" | "off" => Ok(Some(false)),
                _ => Err(self.invalid(key, v, "expected a boolean")),
            },
            Some(other) => Err(self.invalid(key, other, "expected a boolean")),
        }
    }

    /// A YAML sequence or a comma-separated string; empty entries are dropped
    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(self.invalid(key, other, "list entries must be scalars")),
                })
                .filter(|r| r.as_ref().map_or(true, |s| !s.is_empty()))
                .collect(),
            Some(other) => Err(self.invalid(key, other, "expected a list")),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Parse a task file: a mapping of section name to a mapping of keys
pub fn parse_task_sections(content: &str) -> Result<Vec<Section>> {
    let doc: Value = serde_yaml::from_str(content).context("Failed to parse task file")?;
    let mapping = match doc {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(m) => m,
        _ => return Err(eyre!("Task file must be a mapping of section names")),
    };

    let mut sections = Vec::with_capacity(mapping.len());
    for (name, body) in mapping {
        let name = match name {
            Value::String(s) => s,
            other => return Err(eyre!("Section name must be a string, got {}", render(&other))),
        };
        let values = match body {
            Value::Mapping(m) => m,
            Value::Null => Default::default(),
            _ => return Err(eyre!("Section {} must be a mapping", name)),
        };

        let mut section = Section::new(&name);
        for (key, value) in values {
            match key {
                Value::String(k) => {
                    section.values.insert(k, value);
                }
                other => return Err(eyre!("Section {}: key {} is not a string", name, render(&other))),
            }
        }
        sections.push(section);
    }
    Ok(sections)
}

pub fn load_task_file(path: &Path) -> Result<Vec<Section>> {
    let content = fs::read_to_string(path).context(format!("Failed to read task file {}", path.display()))?;
    let sections = parse_task_sections(&content).context(format!("In {}", path.display()))?;
    debug!(path = %path.display(), sections = sections.len(), "Loaded task file");
    Ok(sections)
}

/// Build tasks from every section, skipping bad ones.
///
/// Identical rules are kept once. Errors come back paired with their section.
pub fn tasks_from_config(
    sections: &[Section],
    resolver: &dyn MilestoneResolver,
) -> (Vec<Task>, Vec<(String, ConfigError)>) {
    let mut tasks = Vec::new();
    let mut seen = HashSet::new();
    let mut errors = Vec::new();

    for section in sections {
        match Task::from_config_section(section.name(), section, resolver) {
            Ok(task) => {
                if seen.insert(task.clone()) {
                    tasks.push(task);
                } else {
                    info!(section = section.name(), "Dropping duplicate task");
                }
            }
            Err(e) => {
                warn!(section = section.name(), error = %e, "Skipping bad task section");
                errors.push((section.name().to_string(), e));
            }
        }
    }

    (tasks, errors)
}

/// Scheduler knobs; every field is optional in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub abort_threshold: f64,
    pub poll_interval_secs: u64,
    pub results_poll_interval_secs: u64,
    pub journal_dir: Option<PathBuf>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            abort_threshold: DEFAULT_ABORT_THRESHOLD,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            results_poll_interval_secs: RESULTS_POLL_INTERVAL.as_secs(),
            journal_dir: None,
        }
    }
}

impl LabConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("suitesched").join("config.yaml"))
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).context(format!("Failed to read config {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(&content).context(format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location when there is one
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.abort_threshold) {
            return Err(eyre!("abort_threshold must be within 0..=1, got {}", self.abort_threshold));
        }
        Ok(())
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.journal_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("suitesched")
        })
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::default().with_interval(Duration::from_secs(self.poll_interval_secs))
    }

    pub fn results_poll_interval(&self) -> Duration {
        Duration::from_secs(self.results_poll_interval_secs)
    }
}
