use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use warden_core::OrchestratorConfig;

use crate::sources::{EnvConfig, FileConfig, InvalidEnvVar};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["warden.toml", "config/warden.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` loading entirely.
    pub skip_env_file: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: OrchestratorConfig,
    pub metadata: ConfigMetadata,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    InvalidEnv(#[from] InvalidEnvVar),
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env` into the process environment, then resolves the
    /// configuration against it.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let env = EnvConfig::gather()?;
        let mut load = self.load_with_env(env)?;
        load.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolves the configuration against an explicit set of environment
    /// overrides without touching the process environment.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;

        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No warden.toml detected; using defaults and WARDEN_* environment variables",
                "Pass --config or set WARDEN_CONFIG to point at a configuration file",
            );
        }

        let config = compose_config(file_config.unwrap_or_default(), env);
        warnings.extend(validation::apply_guard_rails(&config)?);

        for warning in warnings.iter() {
            tracing::warn!(
                target: "warden::config",
                hint = warning.hint.as_deref().unwrap_or(""),
                "{}",
                warning.message
            );
        }
        tracing::info!(
            target: "warden::config",
            path = ?config_path,
            warnings = warnings.len(),
            "configuration loaded"
        );

        Ok(ConfigLoad {
            config,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded: false,
            },
            warnings,
        })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        // A missing .env is normal; a malformed one is not.
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // An explicitly named file must exist; default locations are optional.
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Environment beats file, file beats defaults.
fn compose_config(file: FileConfig, env: EnvConfig) -> OrchestratorConfig {
    let defaults = OrchestratorConfig::default();
    let FileConfig {
        rate_limit,
        concurrency,
        network,
        tools,
        task,
        output,
    } = file;

    let mut config = defaults.clone();

    let policy = &mut config.policy;
    policy.rate_limit.tokens_per_second = env
        .rate_limit_tokens_per_second
        .or(rate_limit.tokens_per_second)
        .unwrap_or(defaults.policy.rate_limit.tokens_per_second);
    policy.rate_limit.burst = env
        .rate_limit_burst
        .or(rate_limit.burst)
        .unwrap_or(defaults.policy.rate_limit.burst);
    policy.rate_limit.scope = env
        .rate_limit_scope
        .or(rate_limit.scope)
        .unwrap_or(defaults.policy.rate_limit.scope);
    policy.rate_limit.redis_url = env.rate_limit_redis_url.or(rate_limit.redis_url);

    policy.concurrency.max_global_jobs = env
        .concurrency_max_global_jobs
        .or(concurrency.max_global_jobs)
        .unwrap_or(defaults.policy.concurrency.max_global_jobs);
    policy.concurrency.max_global_tools = env
        .concurrency_max_global_tools
        .or(concurrency.max_global_tools)
        .unwrap_or(defaults.policy.concurrency.max_global_tools);
    policy.concurrency.max_tools_per_job = env
        .concurrency_max_tools_per_job
        .or(concurrency.max_tools_per_job)
        .unwrap_or(defaults.policy.concurrency.max_tools_per_job);

    policy.network.allow_list = env
        .network_allow_list
        .or(network.allow_list)
        .unwrap_or_default();
    policy.network.deny_list = env
        .network_deny_list
        .or(network.deny_list)
        .unwrap_or_default();
    policy.network.require_explicit_approval = env
        .network_require_explicit_approval
        .or(network.require_explicit_approval)
        .unwrap_or(defaults.policy.network.require_explicit_approval);

    policy.tools.default_risk = env
        .tools_default_risk
        .or(tools.default_risk)
        .unwrap_or(defaults.policy.tools.default_risk);
    policy.tools.approval_threshold = env
        .tools_approval_threshold
        .or(tools.approval_threshold)
        .unwrap_or(defaults.policy.tools.approval_threshold);
    policy.tools.disabled = env.tools_disabled.or(tools.disabled).unwrap_or_default();
    policy.tools.risk_table = tools.risk_table.unwrap_or_default();
    policy.tools.rate_cost = tools.rate_cost.unwrap_or_default();
    policy.tools.commands = tools.commands.unwrap_or_default();

    config.task.max_retries = env
        .task_max_retries
        .or(task.max_retries)
        .unwrap_or(defaults.task.max_retries);
    config.task.workers = env
        .task_workers
        .or(task.workers)
        .unwrap_or(defaults.task.workers);
    config.task.enqueue_attempts = task
        .enqueue_attempts
        .unwrap_or(defaults.task.enqueue_attempts);
    config.task.soft_timeout_ms = env
        .task_soft_timeout
        .or(task.soft_timeout)
        .map_or(defaults.task.soft_timeout_ms, millis);
    config.task.hard_timeout_ms = env
        .task_hard_timeout
        .or(task.hard_timeout)
        .map_or(defaults.task.hard_timeout_ms, millis);
    config.task.admission_retry_ms = task
        .admission_retry
        .map_or(defaults.task.admission_retry_ms, millis);
    config.task.poll_interval_ms = task
        .poll_interval
        .map_or(defaults.task.poll_interval_ms, millis);

    config.retry.backoff_base_ms = task
        .backoff_base
        .map_or(defaults.retry.backoff_base_ms, millis);
    config.retry.backoff_max_ms = task
        .backoff_max
        .map_or(defaults.retry.backoff_max_ms, millis);
    config.retry.jitter_ratio = task.jitter_ratio.unwrap_or(defaults.retry.jitter_ratio);
    config.retry.jitter_min_ms = task
        .jitter_min
        .map_or(defaults.retry.jitter_min_ms, millis);

    // Unset keeps the TTL derived from the hard timeout.
    config.lease.lease_ttl_ms = env.task_lease_ttl.or(task.lease_ttl).map(millis);
    config.lease.housekeeper_interval_ms = task
        .housekeeper_interval
        .map_or(defaults.lease.housekeeper_interval_ms, millis);

    config.output.dir = env
        .output_dir
        .or(output.dir)
        .unwrap_or(defaults.output.dir);

    config
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
