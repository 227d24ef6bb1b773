use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::HerdErr;
use crate::error::Result;

/// Env var that switches the supervisor into debug mode.
pub const DEBUG_ENV_VAR: &str = "HERD_DEBUG";

const DEFAULT_EVICTION_DELAY_MS: u64 = 300_000;
const DEBUG_EVICTION_DELAY_MS: u64 = 30_000;
const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_TERMINATION_GRACE_MS: u64 = 1_000;
pub const DEFAULT_LOG_TAIL_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// When false the worker sees only the encoded instance config.
    pub inherit_env: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["sub_unix_socket_server.py".to_string()],
            cwd: PathBuf::from("."),
            inherit_env: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HerdConfig {
    pub worker: WorkerConfig,
    /// Directory holding every instance's control socket. Wiped on start.
    pub scratch_dir: PathBuf,
    pub debug: bool,
    /// Delay between an instance dying and the registry forgetting it.
    /// Derived from `debug` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_delay_ms: Option<u64>,
    pub login_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub termination_grace_ms: u64,
    pub log_tail_chars: usize,
}

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            scratch_dir: PathBuf::from("./sockets"),
            debug: false,
            eviction_delay_ms: None,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            log_tail_chars: DEFAULT_LOG_TAIL_CHARS,
        }
    }
}

impl HerdConfig {
    /// Loads `path`, falling back to defaults when the file does not exist,
    /// then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).map_err(|message| HerdErr::Config {
                path: path.to_path_buf(),
                message,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(config.with_env_overrides())
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, String> {
        toml::from_str(contents).map_err(|err| err.to_string())
    }

    pub fn to_toml(&self) -> std::result::Result<String, String> {
        toml::to_string_pretty(self).map_err(|err| err.to_string())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(DEBUG_ENV_VAR) {
            self.debug = matches!(value.trim(), "1" | "true" | "yes");
        }
        self
    }

    pub fn eviction_delay(&self) -> Duration {
        let ms = self.eviction_delay_ms.unwrap_or(if self.debug {
            DEBUG_EVICTION_DELAY_MS
        } else {
            DEFAULT_EVICTION_DELAY_MS
        });
        Duration::from_millis(ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}
