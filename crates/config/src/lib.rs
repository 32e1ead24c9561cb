#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Configuration objects for the dispatch controller.

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

/// Name of the environment variable carrying the `RESOURCES_AWARE` headroom
/// threshold. Misspelled in the upstream system this was distilled from;
/// retained verbatim for behavioural compatibility (see §6 of the spec).
pub const THRESHOLD_ENV_VAR: &str = "THRESOLD";

/// Accepted alias for [`THRESHOLD_ENV_VAR`]. `THRESOLD` wins if both are set.
pub const THRESHOLD_ENV_VAR_ALIAS: &str = "THRESHOLD";

/// Default `RESOURCES_AWARE` headroom threshold when neither environment
/// variable is set.
pub const DEFAULT_THRESHOLD: i64 = 100;

/// Errors for the config module.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The config file was read but failed field-level validation.
    #[error("configuration failed validation (config file '{file}', reason: {message})")]
    Validation {
        /// The path to the config file.
        file: String,
        /// The validation failure message.
        message: String,
    },

    /// `load_balance_method` was not one of the closed set of supported
    /// policies.
    #[error("invalid load balance method '{value}', expected one of round_robin, shortest_queue, resources_aware")]
    InvalidPolicy {
        /// The offending configured value.
        value: String,
    },
}

/// The three routing policies a [`DispatcherConfig`] can select, by their
/// case-insensitive configuration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Cycle through replicas in order.
    RoundRobin,
    /// Route to the replica with the shallowest ingress queue.
    ShortestQueue,
    /// Route to the replica with the most projected KV-cache headroom.
    ResourcesAware,
}

impl PolicyKind {
    /// Parses a case-insensitive policy identifier, e.g. `"ROUND_ROBIN"` or
    /// `"round_robin"`.
    pub fn from_str_ci(value: &str) -> Result<Self, Error> {
        match value.to_ascii_uppercase().as_str() {
            "ROUND_ROBIN" => Ok(PolicyKind::RoundRobin),
            "SHORTEST_QUEUE" => Ok(PolicyKind::ShortestQueue),
            "RESOURCES_AWARE" => Ok(PolicyKind::ResourcesAware),
            _ => Err(Error::InvalidPolicy { value: value.to_string() }),
        }
    }
}

/// Configuration of the dispatch controller, as loaded from a YAML file.
///
/// Field names mirror the configuration keys enumerated in the spec (§6):
/// `load_balance_method`, `dp_size`, `tp_size`, `controller_port`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RawDispatcherConfig {
    /// One of `round_robin | shortest_queue | resources_aware`
    /// (case-insensitive).
    pub load_balance_method: String,

    /// Number of replicas `N` (≥ 1).
    #[validate(range(min = 1))]
    pub dp_size: usize,

    /// Accelerator width per replica (≥ 1).
    #[validate(range(min = 1))]
    pub tp_size: usize,

    /// TCP port the intake socket binds to.
    pub controller_port: u16,

    /// Path to the executable spawned for each replica (the out-of-scope
    /// "replica worker" contract).
    pub worker_command: String,

    /// Initial `available_kv_cache` capacity assigned to every replica when
    /// the shared load block is allocated.
    #[serde(default = "default_initial_kv_cache")]
    pub initial_kv_cache: i64,
}

fn default_initial_kv_cache() -> i64 {
    8192
}

/// A fully resolved, validated dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The selected routing policy.
    pub policy: PolicyKind,
    /// Number of replicas.
    pub dp_size: usize,
    /// Accelerator width per replica.
    pub tp_size: usize,
    /// TCP port the intake socket binds to.
    pub controller_port: u16,
    /// Path to the executable spawned for each replica.
    pub worker_command: String,
    /// Initial KV-cache capacity assigned to every replica.
    pub initial_kv_cache: i64,
}

impl DispatcherConfig {
    /// Loads, parses, and validates the dispatcher configuration from a YAML
    /// file.
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let config_file_name = config_file_path.as_ref().display().to_string();

        debug!(file = %config_file_name, "loading dispatcher configuration");

        let config_file = File::open(&config_file_path).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(config_file);
        let raw: RawDispatcherConfig = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;

        raw.validate().map_err(|err| Error::Validation {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;

        let policy = PolicyKind::from_str_ci(&raw.load_balance_method)?;

        debug!(file = %config_file_name, ?policy, dp_size = raw.dp_size, "dispatcher configuration loaded");

        Ok(Self {
            policy,
            dp_size: raw.dp_size,
            tp_size: raw.tp_size,
            controller_port: raw.controller_port,
            worker_command: raw.worker_command,
            initial_kv_cache: raw.initial_kv_cache,
        })
    }

    /// The contiguous accelerator id range assigned to replica `i`:
    /// `[i * tp_size, (i + 1) * tp_size)`.
    pub fn accelerator_range(&self, replica_id: usize) -> std::ops::Range<usize> {
        (replica_id * self.tp_size)..((replica_id + 1) * self.tp_size)
    }
}

/// Reads the `RESOURCES_AWARE` headroom threshold from the environment,
/// preferring the verbatim-compatible (misspelled) `THRESOLD` over its
/// `THRESHOLD` alias, and falling back to [`DEFAULT_THRESHOLD`].
pub fn resources_aware_threshold() -> i64 {
    for var in [THRESHOLD_ENV_VAR, THRESHOLD_ENV_VAR_ALIAS] {
        if let Ok(value) = std::env::var(var) {
            match value.parse::<i64>() {
                Ok(parsed) => return parsed,
                Err(err) => {
                    tracing::warn!(%var, %value, %err, "ignoring unparsable threshold override");
                }
            }
        }
    }
    DEFAULT_THRESHOLD
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn policy_parsing_is_case_insensitive() {
        assert_eq!(PolicyKind::from_str_ci("round_robin").unwrap(), PolicyKind::RoundRobin);
        assert_eq!(PolicyKind::from_str_ci("ROUND_ROBIN").unwrap(), PolicyKind::RoundRobin);
        assert_eq!(
            PolicyKind::from_str_ci("Resources_Aware").unwrap(),
            PolicyKind::ResourcesAware
        );
    }

    #[test]
    fn policy_parsing_rejects_unknown_identifiers() {
        let err = PolicyKind::from_str_ci("least_connections").unwrap_err();
        assert!(matches!(err, Error::InvalidPolicy { .. }));
    }

    #[test]
    fn loads_a_valid_config_file() {
        let file = write_yaml(
            "load_balance_method: shortest_queue\n\
             dp_size: 3\n\
             tp_size: 2\n\
             controller_port: 19000\n\
             worker_command: /bin/true\n",
        );
        let config = DispatcherConfig::load(file.path()).expect("load config");
        assert_eq!(config.policy, PolicyKind::ShortestQueue);
        assert_eq!(config.dp_size, 3);
        assert_eq!(config.accelerator_range(1), 2..4);
    }

    #[test]
    fn rejects_zero_dp_size() {
        let file = write_yaml(
            "load_balance_method: round_robin\n\
             dp_size: 0\n\
             tp_size: 1\n\
             controller_port: 19000\n\
             worker_command: /bin/true\n",
        );
        let err = DispatcherConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn threshold_defaults_to_100_when_unset() {
        std::env::remove_var(THRESHOLD_ENV_VAR);
        std::env::remove_var(THRESHOLD_ENV_VAR_ALIAS);
        assert_eq!(resources_aware_threshold(), DEFAULT_THRESHOLD);
    }

    #[test]
    fn threshold_prefers_the_misspelled_variable_over_its_alias() {
        std::env::set_var(THRESHOLD_ENV_VAR, "42");
        std::env::set_var(THRESHOLD_ENV_VAR_ALIAS, "7");
        assert_eq!(resources_aware_threshold(), 42);
        std::env::remove_var(THRESHOLD_ENV_VAR);
        std::env::remove_var(THRESHOLD_ENV_VAR_ALIAS);
    }
}
