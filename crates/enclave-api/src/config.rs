//! Server configuration.

use std::time::Duration;

use enclave_core::{Error, LogFormat, Result};
use enclave_flow::cloud::CloudNotifierConfig;
use enclave_flow::poller::PollPolicy;
use enclave_flow::workflow::{WorkflowConfig, DEFAULT_STORAGE_ALIAS};

/// Program that submits ledger transactions when none is configured.
pub const DEFAULT_LEDGER_PROGRAM: &str = "enclave-ledger";

/// Server configuration, read from `ENCLAVE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP port (`ENCLAVE_HTTP_PORT`).
    pub http_port: u16,
    /// Debug mode (`ENCLAVE_DEBUG`): pretty logs, in-memory fallbacks.
    pub debug: bool,
    /// Log format override (`ENCLAVE_LOG_FORMAT`: `json` or `pretty`).
    pub log_format: Option<LogFormat>,
    /// S3-compatible endpoint for enclave logs and state (`ENCLAVE_S3_ENDPOINT`).
    pub s3_endpoint: Option<String>,
    /// Hypervisor base URL (`ENCLAVE_HYPERVISOR_URL`).
    pub hypervisor_url: Option<String>,
    /// Ledger submitter program (`ENCLAVE_LEDGER_PROGRAM`).
    pub ledger_program: String,
    /// Bucket holding the workflow snapshot (`ENCLAVE_STATE_BUCKET`).
    pub state_bucket: Option<String>,
    /// Alias enclave logs are resolved under (`ENCLAVE_STORAGE_ALIAS`).
    pub storage_alias: String,
    /// Job poll retry budget (`ENCLAVE_POLL_BUDGET`).
    pub poll_budget: u32,
    /// First job poll wait in milliseconds (`ENCLAVE_POLL_INITIAL_WAIT_MS`).
    pub poll_initial_wait_ms: u64,
    /// Enclave log idle timeout in seconds (`ENCLAVE_LOG_IDLE_TIMEOUT_SECS`).
    pub log_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let poll = PollPolicy::default();
        let cloud = CloudNotifierConfig::default();
        Self {
            http_port: 8080,
            debug: false,
            log_format: None,
            s3_endpoint: None,
            hypervisor_url: None,
            ledger_program: DEFAULT_LEDGER_PROGRAM.to_string(),
            state_bucket: None,
            storage_alias: DEFAULT_STORAGE_ALIAS.to_string(),
            poll_budget: poll.retry_budget,
            poll_initial_wait_ms: u64::try_from(poll.initial_wait.as_millis())
                .unwrap_or(u64::MAX),
            log_idle_timeout_secs: cloud.idle_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("ENCLAVE_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("ENCLAVE_DEBUG")? {
            config.debug = debug;
        }
        if let Some(format) = env_string("ENCLAVE_LOG_FORMAT") {
            config.log_format = Some(parse_log_format("ENCLAVE_LOG_FORMAT", &format)?);
        }
        config.s3_endpoint = env_string("ENCLAVE_S3_ENDPOINT");
        config.hypervisor_url = env_string("ENCLAVE_HYPERVISOR_URL");
        if let Some(program) = env_string("ENCLAVE_LEDGER_PROGRAM") {
            config.ledger_program = program;
        }
        config.state_bucket = env_string("ENCLAVE_STATE_BUCKET");
        if let Some(alias) = env_string("ENCLAVE_STORAGE_ALIAS") {
            config.storage_alias = alias;
        }
        if let Some(budget) = env_u64("ENCLAVE_POLL_BUDGET")? {
            config.poll_budget = u32::try_from(budget).map_err(|_| {
                Error::InvalidInput("ENCLAVE_POLL_BUDGET must fit in a u32".to_string())
            })?;
        }
        if let Some(wait) = env_u64("ENCLAVE_POLL_INITIAL_WAIT_MS")? {
            config.poll_initial_wait_ms = wait;
        }
        if let Some(timeout) = env_u64("ENCLAVE_LOG_IDLE_TIMEOUT_SECS")? {
            if timeout == 0 {
                return Err(Error::InvalidInput(
                    "ENCLAVE_LOG_IDLE_TIMEOUT_SECS must be greater than 0".to_string(),
                ));
            }
            config.log_idle_timeout_secs = timeout;
        }

        Ok(config)
    }

    /// Log format: the explicit override, else pretty in debug and JSON otherwise.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or(if self.debug {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        })
    }

    /// Workflow tunables derived from this configuration.
    #[must_use]
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            poll: PollPolicy {
                retry_budget: self.poll_budget,
                initial_wait: Duration::from_millis(self.poll_initial_wait_ms),
                ..PollPolicy::default()
            },
            cloud: CloudNotifierConfig {
                idle_timeout: Duration::from_secs(self.log_idle_timeout_secs),
                ..CloudNotifierConfig::default()
            },
            storage_alias: self.storage_alias.clone(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_log_format(name: &str, value: &str) -> Result<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be one of: json, pretty (got {value})"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_workflow_defaults() {
        let config = Config::default();
        assert_eq!(config.workflow_config(), WorkflowConfig::default());
        assert_eq!(config.log_format(), LogFormat::Json);
    }

    #[test]
    fn debug_selects_pretty_logs_unless_overridden() {
        let mut config = Config {
            debug: true,
            ..Config::default()
        };
        assert_eq!(config.log_format(), LogFormat::Pretty);
        config.log_format = Some(LogFormat::Json);
        assert_eq!(config.log_format(), LogFormat::Json);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn parse_log_format_rejects_unknown() {
        assert_eq!(parse_log_format("X", "JSON").unwrap(), LogFormat::Json);
        assert!(parse_log_format("X", "xml").is_err());
    }
}
