// suitesched - Test-suite scheduling and result reconciliation for a device test lab

pub mod branch;
pub mod config;
pub mod error;
pub mod filter;
pub mod host_group;
pub mod job_status;
pub mod journal;
pub mod jsonl;
pub mod retry;
pub mod services;
pub mod status;
pub mod suite;
pub mod task;
pub mod trigger;
pub mod version;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use branch::{BranchMatcher, BranchSpec, MilestoneResolver};
pub use config::{LabConfig, Section};
pub use error::{ConfigError, ResolutionError, SchedulingError, SuiteError};
pub use filter::{Field, Filter, FilterOp};
pub use job_status::{ResultPoller, WaitOptions};
pub use journal::Journal;
pub use status::{Status, StatusCode, StatusLogEntry, StatusRecorder};
pub use suite::{BugTemplate, SuiteArgs, SuiteEnv, SuiteOutcome, SuiteSpec, reimage_and_run};
pub use task::{Task, TaskEnv};
pub use trigger::{Priority, Trigger};

// Re-export rusqlite for CLI use
pub use rusqlite;
