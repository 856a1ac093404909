// Typed errors for decisions callers branch on

use thiserror::Error;

/// A task section that cannot be turned into a scheduling rule.
///
/// Fatal to the one section only; loaders report it and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("section {section}: missing required key `{key}`")]
    MissingKey { section: String, key: &'static str },

    #[error("section {section}: unknown keys {keys:?}")]
    UnknownKeys { section: String, keys: Vec<String> },

    #[error("section {section}: `{key}` has invalid value {value:?}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("{spec} isn't a valid branch spec")]
    InvalidBranchSpec { spec: String },

    #[error("only one numeric branch spec is allowed, found {first} and {second}")]
    MultipleNumericSpecs { first: String, second: String },

    #[error("section {section}: cannot specify both cros_build_spec and firmware_rw_build_spec")]
    ConflictingBuildSpecs { section: String },

    #[error("section {section}: test_source must be `cros` or `firmware_rw` when a cross build spec is set")]
    MissingTestSource { section: String },

    #[error("could not resolve branch spec {spec}: {source}")]
    Unresolvable {
        spec: String,
        #[source]
        source: ResolutionError,
    },
}

/// Failure to turn a tip-of-tree or manifest spec into a concrete value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("tip-of-tree milestone unavailable: {0}")]
    TotUnavailable(String),

    #[error("{spec} reaches before milestone 0 (tot is R{tot})")]
    BeforeFirstMilestone { spec: String, tot: u32 },

    #[error("malformed build spec {0}")]
    MalformedSpec(String),

    #[error("no {build_type} manifest for {board} (milestone {milestone:?})")]
    NoManifest {
        board: String,
        build_type: String,
        milestone: Option<u32>,
    },

    #[error("manifest lookup failed: {0}")]
    Lookup(String),
}

/// Raised by a suite scheduler while creating a suite job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("deduping scheduler: {0}")]
    Dedup(String),

    #[error("scheduler rpc failed: {0}")]
    Rpc(String),
}

/// Fatal errors for a single suite run.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("invalid suite arguments: {0}")]
    SuiteArgument(String),

    #[error("failed to stage control files for {build} on {devserver}: {reason}")]
    StageControlFileFailure {
        build: String,
        devserver: String,
        reason: String,
    },

    #[error("build {build} failed to stage: {reason}")]
    AsynchronousBuildFailure { build: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages_name_the_section() {
        let err = ConfigError::MissingKey {
            section: "NightlyPower".to_string(),
            key: "suite",
        };
        assert_eq!(err.to_string(), "section NightlyPower: missing required key `suite`");

        let err = ConfigError::ConflictingBuildSpecs {
            section: "Fw".to_string(),
        };
        assert!(err.to_string().contains("both cros_build_spec and firmware_rw_build_spec"));
    }

    #[test]
    fn test_unresolvable_keeps_source() {
        use std::error::Error as _;

        let err = ConfigError::Unresolvable {
            spec: ">=tot-1".to_string(),
            source: ResolutionError::TotUnavailable("timeout".to_string()),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains(">=tot-1"));
    }
}
