// Scheduling events a task can be attached to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job priority, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Weekly,
    Daily,
    PostBuild,
    Default,
    Build,
    Pfq,
    Cq,
    Super,
}

impl Priority {
    /// Numeric value understood by the job service
    pub fn value(self) -> u32 {
        match self {
            Priority::Weekly => 0,
            Priority::Daily => 10,
            Priority::PostBuild => 20,
            Priority::Default => 30,
            Priority::Build => 40,
            Priority::Pfq => 50,
            Priority::Cq => 60,
            Priority::Super => 70,
        }
    }
}

/// The `run_on` keyword of a task section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Nightly,
    Weekly,
    NewBuild,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Nightly => "nightly",
            Trigger::Weekly => "weekly",
            Trigger::NewBuild => "new_build",
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            Trigger::Nightly => Priority::Daily,
            Trigger::Weekly => Priority::Weekly,
            Trigger::NewBuild => Priority::PostBuild,
        }
    }

    /// Suite timeout in hours
    pub fn timeout_hours(self) -> u32 {
        match self {
            Trigger::Nightly => 24,
            Trigger::Weekly => 7 * 24,
            Trigger::NewBuild => 12,
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "nightly" => Ok(Trigger::Nightly),
            "weekly" => Ok(Trigger::Weekly),
            "new_build" => Ok(Trigger::NewBuild),
            other => Err(format!("unknown trigger `{}` (expected nightly, weekly or new_build)", other)),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
