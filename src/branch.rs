// Branch specs: which branches/milestones a task applies to

use crate::error::{ConfigError, ResolutionError};
use crate::version::LooseVersion;
use eyre::Result;
use std::cell::Cell;
use std::fmt;
use tracing::{debug, info};

/// Branch names that are matched by name only, never by milestone
pub const BARE_BRANCHES: &[&str] = &["factory", "firmware"];

pub fn is_bare_branch(name: &str) -> bool {
    BARE_BRANCHES.contains(&name)
}

/// Comparison recorded for a numeric constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionOp {
    AtLeast,
    AtMost,
    Exactly,
}

impl fmt::Display for VersionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionOp::AtLeast => write!(f, ">="),
            VersionOp::AtMost => write!(f, "<="),
            VersionOp::Exactly => write!(f, "=="),
        }
    }
}

/// One entry of a task's `branch_specs`, with tip-of-tree already resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchSpec {
    Bare(String),
    Numeric { op: VersionOp, milestone: LooseVersion },
}

impl BranchSpec {
    /// Parse a single spec, resolving `tot`/`tot-N` through `resolver`
    pub fn parse(raw: &str, resolver: &dyn MilestoneResolver) -> Result<Self, ConfigError> {
        let spec = raw.trim();
        if is_bare_branch(spec) {
            return Ok(BranchSpec::Bare(spec.to_string()));
        }

        let (op, rest) = split_operator(spec);

        if let Some(idx) = rest.find("tot") {
            // Anything before `tot` other than an operator is junk.
            if idx != 0 {
                return Err(ConfigError::InvalidBranchSpec { spec: raw.to_string() });
            }
            let resolved = convert_tot_spec(rest, resolver).map_err(|source| ConfigError::Unresolvable {
                spec: raw.to_string(),
                source,
            })?;
            debug!(spec = raw, resolved = %resolved, "resolved tot branch spec");
            return Ok(BranchSpec::Numeric {
                op: op.unwrap_or(VersionOp::AtLeast),
                milestone: LooseVersion::milestone(&resolved),
            });
        }

        match op {
            Some(op) if is_milestone(rest) => Ok(BranchSpec::Numeric {
                op,
                milestone: LooseVersion::milestone(rest),
            }),
            _ => Err(ConfigError::InvalidBranchSpec { spec: raw.to_string() }),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, BranchSpec::Numeric { .. })
    }
}

impl fmt::Display for BranchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchSpec::Bare(name) => write!(f, "{}", name),
            BranchSpec::Numeric { op, milestone } => write!(f, "{}R{}", op, milestone),
        }
    }
}

fn split_operator(spec: &str) -> (Option<VersionOp>, &str) {
    if let Some(rest) = spec.strip_prefix(">=") {
        (Some(VersionOp::AtLeast), rest)
    } else if let Some(rest) = spec.strip_prefix("<=") {
        (Some(VersionOp::AtMost), rest)
    } else if let Some(rest) = spec.strip_prefix("==") {
        (Some(VersionOp::Exactly), rest)
    } else {
        (None, spec)
    }
}

/// `R<digits>`
fn is_milestone(s: &str) -> bool {
    s.strip_prefix('R')
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

/// Validate a full spec list: known forms only, at most one numeric constraint.
///
/// Fails on the first offending entry rather than keeping the last one.
pub fn check_branch_specs(specs: &[String], resolver: &dyn MilestoneResolver) -> Result<Vec<BranchSpec>, ConfigError> {
    let mut parsed = Vec::with_capacity(specs.len());
    let mut numeric: Option<&str> = None;

    for raw in specs {
        let spec = BranchSpec::parse(raw, resolver)?;
        if spec.is_numeric() {
            if let Some(first) = numeric {
                return Err(ConfigError::MultipleNumericSpecs {
                    first: first.to_string(),
                    second: raw.clone(),
                });
            }
            numeric = Some(raw.as_str());
        }
        parsed.push(spec);
    }

    Ok(parsed)
}

/// Decides whether a candidate branch satisfies a task's branch specs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchMatcher {
    any: bool,
    bare: Vec<String>,
    numeric: Option<(VersionOp, LooseVersion)>,
}

impl BranchMatcher {
    pub fn new(specs: &[BranchSpec]) -> Self {
        let mut bare = Vec::new();
        let mut numeric = None;
        for spec in specs {
            match spec {
                BranchSpec::Bare(name) => bare.push(name.clone()),
                BranchSpec::Numeric { op, milestone } => numeric = Some((*op, milestone.clone())),
            }
        }
        Self {
            any: specs.is_empty(),
            bare,
            numeric,
        }
    }

    pub fn fits(&self, candidate: &str) -> bool {
        if self.any {
            return true;
        }
        if is_bare_branch(candidate) {
            return self.bare.iter().any(|b| b == candidate);
        }
        match &self.numeric {
            Some((op, constraint)) => {
                let version = LooseVersion::milestone(candidate);
                match op {
                    VersionOp::Exactly => version == *constraint,
                    VersionOp::AtLeast => version >= *constraint,
                    VersionOp::AtMost => version <= *constraint,
                }
            }
            None => false,
        }
    }

    pub fn has_bare(&self, name: &str) -> bool {
        self.bare.iter().any(|b| b == name)
    }
}

// ============================================================================
// Tip-of-tree resolution
// ============================================================================

/// Source of the current tip-of-tree milestone
pub trait MilestoneResolver {
    fn tot_milestone(&self) -> Result<u32, ResolutionError>;
}

/// A resolver pinned to one milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMilestone(pub u32);

impl MilestoneResolver for FixedMilestone {
    fn tot_milestone(&self) -> Result<u32, ResolutionError> {
        Ok(self.0)
    }
}

/// Build-index lookup for the newest milestone under development
pub trait TotSource {
    fn fetch_tot_milestone(&self) -> Result<u32>;
}

/// Fetches tip-of-tree once and serves the cached value until `refresh`
pub struct CachedTotMilestone<S> {
    source: S,
    cached: Cell<Option<u32>>,
}

impl<S: TotSource> CachedTotMilestone<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Cell::new(None),
        }
    }

    /// Drop the cached value and fetch again
    pub fn refresh(&self) -> Result<u32, ResolutionError> {
        self.cached.set(None);
        self.tot_milestone()
    }
}

impl<S: TotSource> MilestoneResolver for CachedTotMilestone<S> {
    fn tot_milestone(&self) -> Result<u32, ResolutionError> {
        if let Some(m) = self.cached.get() {
            return Ok(m);
        }
        let m = self
            .source
            .fetch_tot_milestone()
            .map_err(|e| ResolutionError::TotUnavailable(format!("{:#}", e)))?;
        info!(milestone = m, "cached tip-of-tree milestone");
        self.cached.set(Some(m));
        Ok(m)
    }
}

/// Convert `tot` or `tot-N` into `R<milestone>`
pub fn convert_tot_spec(spec: &str, resolver: &dyn MilestoneResolver) -> Result<String, ResolutionError> {
    let spec = spec.trim();
    let back = match spec.strip_prefix("tot") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix('-')
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ResolutionError::MalformedSpec(spec.to_string()))?,
        None => return Err(ResolutionError::MalformedSpec(spec.to_string())),
    };

    let tot = resolver.tot_milestone()?;
    let milestone = tot
        .checked_sub(back)
        .ok_or_else(|| ResolutionError::BeforeFirstMilestone {
            spec: spec.to_string(),
            tot,
        })?;
    Ok(format!("R{}", milestone))
}
