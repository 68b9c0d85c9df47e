use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::OrchestratorConfig;
use warden_core::model::RiskLevel;
use warden_core::policy::RateLimitScope;

/// Raw configuration as defined in a TOML file. Every key is optional;
/// missing keys fall back to the environment and then to the defaults.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub rate_limit: FileRateLimitConfig,
    #[serde(default)]
    pub concurrency: FileConcurrencyConfig,
    #[serde(default)]
    pub network: FileNetworkConfig,
    #[serde(default)]
    pub tools: FileToolsConfig,
    #[serde(default)]
    pub task: FileTaskConfig,
    #[serde(default)]
    pub output: FileOutputConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileRateLimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<RateLimitScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConcurrencyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_global_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_global_tools: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tools_per_job: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileNetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_explicit_approval: Option<bool>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_risk: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_threshold: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_table: Option<BTreeMap<String, RiskLevel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_cost: Option<BTreeMap<String, u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<BTreeMap<String, Vec<String>>>,
}

/// Durations are humantime strings such as `"90s"` or `"5m"`.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileTaskConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueue_attempts: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ratio: Option<f32>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub soft_timeout: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub hard_timeout: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub backoff_base: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub backoff_max: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub jitter_min: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub admission_retry: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub housekeeper_interval: Option<Duration>,
    #[serde(default, with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileOutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl From<&OrchestratorConfig> for FileConfig {
    /// Renders an effective configuration back into file form, every key set.
    fn from(config: &OrchestratorConfig) -> Self {
        let policy = &config.policy;
        Self {
            rate_limit: FileRateLimitConfig {
                tokens_per_second: Some(policy.rate_limit.tokens_per_second),
                burst: Some(policy.rate_limit.burst),
                scope: Some(policy.rate_limit.scope),
                redis_url: policy.rate_limit.redis_url.clone(),
            },
            concurrency: FileConcurrencyConfig {
                max_global_jobs: Some(policy.concurrency.max_global_jobs),
                max_global_tools: Some(policy.concurrency.max_global_tools),
                max_tools_per_job: Some(policy.concurrency.max_tools_per_job),
            },
            network: FileNetworkConfig {
                allow_list: Some(policy.network.allow_list.clone()),
                deny_list: Some(policy.network.deny_list.clone()),
                require_explicit_approval: Some(policy.network.require_explicit_approval),
            },
            tools: FileToolsConfig {
                default_risk: Some(policy.tools.default_risk),
                approval_threshold: Some(policy.tools.approval_threshold),
                disabled: Some(policy.tools.disabled.clone()),
                risk_table: Some(policy.tools.risk_table.clone()),
                rate_cost: Some(policy.tools.rate_cost.clone()),
                commands: Some(policy.tools.commands.clone()),
            },
            task: FileTaskConfig {
                max_retries: Some(config.task.max_retries),
                workers: Some(config.task.workers),
                enqueue_attempts: Some(config.task.enqueue_attempts),
                jitter_ratio: Some(config.retry.jitter_ratio),
                soft_timeout: Some(config.task.soft_timeout()),
                hard_timeout: Some(config.task.hard_timeout()),
                backoff_base: Some(Duration::from_millis(config.retry.backoff_base_ms)),
                backoff_max: Some(Duration::from_millis(config.retry.backoff_max_ms)),
                jitter_min: Some(Duration::from_millis(config.retry.jitter_min_ms)),
                lease_ttl: config.lease.lease_ttl_ms.map(Duration::from_millis),
                admission_retry: Some(config.task.admission_retry()),
                housekeeper_interval: Some(config.lease.housekeeper_interval()),
                poll_interval: Some(config.task.poll_interval()),
            },
            output: FileOutputConfig {
                dir: Some(config.output.dir.clone()),
            },
        }
    }
}

/// An environment variable that is set but cannot be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("environment variable {name}={value:?} is invalid: {reason}")]
pub struct InvalidEnvVar {
    pub name: String,
    pub value: String,
    pub reason: String,
}

/// Environment-derived configuration values (`WARDEN_<SECTION>_<KEY>`).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub rate_limit_tokens_per_second: Option<f64>,
    pub rate_limit_burst: Option<u32>,
    pub rate_limit_scope: Option<RateLimitScope>,
    pub rate_limit_redis_url: Option<String>,
    pub concurrency_max_global_jobs: Option<usize>,
    pub concurrency_max_global_tools: Option<usize>,
    pub concurrency_max_tools_per_job: Option<usize>,
    pub network_allow_list: Option<Vec<String>>,
    pub network_deny_list: Option<Vec<String>>,
    pub network_require_explicit_approval: Option<bool>,
    pub tools_default_risk: Option<RiskLevel>,
    pub tools_approval_threshold: Option<RiskLevel>,
    pub tools_disabled: Option<Vec<String>>,
    pub task_max_retries: Option<u16>,
    pub task_workers: Option<usize>,
    pub task_soft_timeout: Option<Duration>,
    pub task_hard_timeout: Option<Duration>,
    pub task_lease_ttl: Option<Duration>,
    pub output_dir: Option<PathBuf>,
}

impl EnvConfig {
    /// Reads the process environment.
    pub fn gather() -> Result<Self, InvalidEnvVar> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the overrides from an explicit set of variables. Variables
    /// outside the `WARDEN_` namespace are ignored; blank values count as
    /// unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, InvalidEnvVar>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = Vars(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .filter(|(key, value)| key.starts_with("WARDEN_") && !value.trim().is_empty())
                .collect(),
        );

        Ok(Self {
            config_path: vars.string("WARDEN_CONFIG").map(PathBuf::from),
            rate_limit_tokens_per_second: vars.parse("WARDEN_RATE_LIMIT_TOKENS_PER_SECOND")?,
            rate_limit_burst: vars.parse("WARDEN_RATE_LIMIT_BURST")?,
            rate_limit_scope: vars.scope("WARDEN_RATE_LIMIT_SCOPE")?,
            rate_limit_redis_url: vars.string("WARDEN_RATE_LIMIT_REDIS_URL"),
            concurrency_max_global_jobs: vars.parse("WARDEN_CONCURRENCY_MAX_GLOBAL_JOBS")?,
            concurrency_max_global_tools: vars.parse("WARDEN_CONCURRENCY_MAX_GLOBAL_TOOLS")?,
            concurrency_max_tools_per_job: vars.parse("WARDEN_CONCURRENCY_MAX_TOOLS_PER_JOB")?,
            network_allow_list: vars.csv("WARDEN_NETWORK_ALLOW_LIST"),
            network_deny_list: vars.csv("WARDEN_NETWORK_DENY_LIST"),
            network_require_explicit_approval: vars
                .bool("WARDEN_NETWORK_REQUIRE_EXPLICIT_APPROVAL")?,
            tools_default_risk: vars.parse("WARDEN_TOOLS_DEFAULT_RISK")?,
            tools_approval_threshold: vars.parse("WARDEN_TOOLS_APPROVAL_THRESHOLD")?,
            tools_disabled: vars.csv("WARDEN_TOOLS_DISABLED"),
            task_max_retries: vars.parse("WARDEN_TASK_MAX_RETRIES")?,
            task_workers: vars.parse("WARDEN_TASK_WORKERS")?,
            task_soft_timeout: vars.duration("WARDEN_TASK_SOFT_TIMEOUT")?,
            task_hard_timeout: vars.duration("WARDEN_TASK_HARD_TIMEOUT")?,
            task_lease_ttl: vars.duration("WARDEN_TASK_LEASE_TTL")?,
            output_dir: vars.string("WARDEN_OUTPUT_DIR").map(PathBuf::from),
        })
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn string(&self, name: &str) -> Option<String> {
        self.0.get(name).map(|value| value.trim().to_string())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, InvalidEnvVar>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|raw| raw.parse::<T>().map_err(|err| invalid(name, &raw, err)))
            .transpose()
    }

    fn csv(&self, name: &str) -> Option<Vec<String>> {
        self.0.get(name).map(|raw| parse_csv(raw))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, InvalidEnvVar> {
        self.string(name)
            .map(|raw| parse_bool(&raw).ok_or_else(|| invalid(name, &raw, "expected true/false")))
            .transpose()
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>, InvalidEnvVar> {
        self.string(name)
            .map(|raw| humantime::parse_duration(&raw).map_err(|err| invalid(name, &raw, err)))
            .transpose()
    }

    fn scope(&self, name: &str) -> Result<Option<RateLimitScope>, InvalidEnvVar> {
        self.string(name)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "per_target" => Ok(RateLimitScope::PerTarget),
                "global" => Ok(RateLimitScope::Global),
                _ => Err(invalid(name, &raw, "expected per_target or global")),
            })
            .transpose()
    }
}

fn invalid(name: &str, value: &str, reason: impl Display) -> InvalidEnvVar {
    InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_are_namespaced_and_parsed() {
        let env = EnvConfig::from_vars([
            ("WARDEN_RATE_LIMIT_BURST", "20"),
            ("WARDEN_RATE_LIMIT_SCOPE", "global"),
            ("WARDEN_NETWORK_DENY_LIST", "10.0.0.0/8, ,vault.example.com"),
            ("WARDEN_NETWORK_REQUIRE_EXPLICIT_APPROVAL", "yes"),
            ("WARDEN_TOOLS_APPROVAL_THRESHOLD", "critical"),
            ("WARDEN_TASK_HARD_TIMEOUT", "90s"),
            ("WARDEN_TASK_WORKERS", "  "),
            ("RATE_LIMIT_BURST", "99"),
        ])
        .expect("valid env");

        assert_eq!(env.rate_limit_burst, Some(20));
        assert_eq!(env.rate_limit_scope, Some(RateLimitScope::Global));
        assert_eq!(
            env.network_deny_list,
            Some(vec!["10.0.0.0/8".to_string(), "vault.example.com".to_string()])
        );
        assert_eq!(env.network_require_explicit_approval, Some(true));
        assert_eq!(env.tools_approval_threshold, Some(RiskLevel::Critical));
        assert_eq!(env.task_hard_timeout, Some(Duration::from_secs(90)));
        assert_eq!(env.task_workers, None);
    }

    #[test]
    fn malformed_env_value_names_the_variable() {
        let err = EnvConfig::from_vars([("WARDEN_CONCURRENCY_MAX_GLOBAL_JOBS", "many")])
            .expect_err("not a number");
        assert_eq!(err.name, "WARDEN_CONCURRENCY_MAX_GLOBAL_JOBS");
        assert_eq!(err.value, "many");
    }

    #[test]
    fn file_durations_are_humantime_strings() {
        let file: FileConfig = toml::from_str(
            r#"
            [task]
            soft_timeout = "5m"
            hard_timeout = "6m 30s"
            admission_retry = "250ms"
            "#,
        )
        .expect("parse");

        assert_eq!(file.task.soft_timeout, Some(Duration::from_secs(300)));
        assert_eq!(file.task.hard_timeout, Some(Duration::from_secs(390)));
        assert_eq!(file.task.admission_retry, Some(Duration::from_millis(250)));
        assert!(toml::from_str::<FileConfig>("[task]\nsoft_timeout = \"soon\"").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("[concurrency]\nmax_jobs = 3").is_err());
    }
}
