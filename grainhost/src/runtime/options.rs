//! Configuration options for the registry, the process starter, and logging.

use grainhost_shared::{GrainhostError, GrainhostResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_IDLE_TIMEOUT_SECS: &str = "GRAINHOST_IDLE_TIMEOUT_SECS";
pub const ENV_REAP_INTERVAL_SECS: &str = "GRAINHOST_REAP_INTERVAL_SECS";
pub const ENV_SHUTDOWN_TIMEOUT_SECS: &str = "GRAINHOST_SHUTDOWN_TIMEOUT_SECS";

/// Registry-wide options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    /// How long a container must sit unused before it may be evicted.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Period of the background reaper started by `spawn_reaper`.
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
    /// Upper bound on a single `Container::shutdown` call.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RegistryOptions {
    /// Defaults overlaid with `GRAINHOST_*` environment variables.
    pub fn from_env() -> GrainhostResult<Self> {
        let mut options = Self::default();
        if let Some(secs) = env_secs(ENV_IDLE_TIMEOUT_SECS)? {
            options.idle_timeout = secs;
        }
        if let Some(secs) = env_secs(ENV_REAP_INTERVAL_SECS)? {
            options.reap_interval = secs;
        }
        if let Some(secs) = env_secs(ENV_SHUTDOWN_TIMEOUT_SECS)? {
            options.shutdown_timeout = secs;
        }
        options.sanitize()?;
        Ok(options)
    }

    /// Reject values the reaper or shutdown path cannot work with.
    pub fn sanitize(&self) -> GrainhostResult<()> {
        if self.reap_interval.is_zero() {
            return Err(GrainhostError::Config(
                "reap_interval must be greater than zero".into(),
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(GrainhostError::Config(
                "shutdown_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Options for [`crate::container::ProcessStarter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStarterOptions {
    /// Program launched once per grain.
    pub program: PathBuf,
    /// Arguments; every `{grain_id}` is replaced with the grain id.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the child, inherited when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "default_shutdown_grace", with = "duration_secs")]
    pub shutdown_grace: Duration,
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl ProcessStarterOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn sanitize(&self) -> GrainhostResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(GrainhostError::Config("program must not be empty".into()));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(GrainhostError::Config(format!(
                    "working_dir is not a directory: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Arguments with `{grain_id}` substituted.
    pub(crate) fn args_for(&self, grain_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{grain_id}", grain_id))
            .collect()
    }
}

/// Logging options consumed by [`crate::init_logging`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for daily-rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: Option<String>,
}

fn env_secs(key: &str) -> GrainhostResult<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| GrainhostError::Config(format!("{key}={raw:?} is not a number: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(GrainhostError::Config(format!("{key}: {e}"))),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let options = RegistryOptions::default();
        assert!(options.sanitize().is_ok());
        assert!(options.idle_timeout > options.reap_interval);
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let options = RegistryOptions {
            reap_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = options.sanitize().unwrap_err();
        assert!(err.to_string().contains("reap_interval"));
    }

    #[test]
    fn test_registry_options_from_json() {
        let options: RegistryOptions =
            serde_json::from_str(r#"{"idle_timeout": 60, "reap_interval": 5}"#).unwrap();
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.reap_interval, Duration::from_secs(5));
        assert_eq!(options.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_process_options_substitute_grain_id() {
        let options = ProcessStarterOptions::new("/usr/bin/grain-runner")
            .arg("--grain")
            .arg("{grain_id}")
            .arg("--data=/var/grains/{grain_id}");
        assert_eq!(
            options.args_for("abc"),
            vec!["--grain", "abc", "--data=/var/grains/abc"]
        );
    }

    #[test]
    fn test_process_options_defaults_from_json() {
        let options: ProcessStarterOptions =
            serde_json::from_str(r#"{"program": "/bin/true"}"#).unwrap();
        assert!(options.args.is_empty());
        assert_eq!(options.shutdown_grace, Duration::from_secs(5));
        assert!(options.sanitize().is_ok());
    }

    #[test]
    fn test_empty_program_rejected() {
        assert!(ProcessStarterOptions::new("").sanitize().is_err());
    }
}
