use thiserror::Error;
use warden_core::OrchestratorConfig;
use warden_core::policy::{PolicyEngine, PolicyError};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("tool {tool} costs {cost} tokens but the bucket only holds {burst}")]
    CostExceedsBurst { tool: String, cost: u32, burst: u32 },
    #[error("task.soft_timeout ({soft_ms}ms) exceeds task.hard_timeout ({hard_ms}ms)")]
    SoftTimeoutExceedsHard { soft_ms: u64, hard_ms: u64 },
    #[error("task.lease_ttl ({lease_ms}ms) must exceed task.hard_timeout ({hard_ms}ms)")]
    LeaseShorterThanRun { lease_ms: u64, hard_ms: u64 },
    #[error("{field} {reason}")]
    InvalidTaskSetting { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Rejects configurations the runtime cannot honour and collects warnings
/// for ones it can run but probably should not.
pub fn apply_guard_rails(
    config: &OrchestratorConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    // Network rules and counter limits are checked by the engine itself.
    PolicyEngine::new(&config.policy)?;

    let burst = config.policy.rate_limit.burst;
    if let Some((tool, cost)) = config
        .policy
        .tools
        .rate_cost
        .iter()
        .find(|(_, cost)| **cost > burst)
    {
        return Err(ConfigGuardRailError::CostExceedsBurst {
            tool: tool.clone(),
            cost: *cost,
            burst,
        });
    }

    validate_task(config, &mut warnings)?;

    let network = &config.policy.network;
    if network.allow_list.is_empty() && !network.require_explicit_approval {
        warnings.push_with_hint(
            "network.allow_list is empty; any target not deny-listed will be scanned",
            "Add allow rules or set network.require_explicit_approval = true",
        );
    }

    let concurrency = &config.policy.concurrency;
    if concurrency.max_tools_per_job > concurrency.max_global_tools {
        warnings.push(format!(
            "concurrency.max_tools_per_job ({}) exceeds concurrency.max_global_tools ({}); \
             the global ceiling will bind first",
            concurrency.max_tools_per_job, concurrency.max_global_tools
        ));
    }
    if config.task.workers < concurrency.max_global_tools {
        warnings.push_with_hint(
            format!(
                "task.workers ({}) is below concurrency.max_global_tools ({}); \
                 at most {} tools will run at once",
                config.task.workers, concurrency.max_global_tools, config.task.workers
            ),
            "Raise task.workers to use the full tool budget",
        );
    }

    let tools = &config.policy.tools;
    if tools.commands.is_empty() {
        warnings.push_with_hint(
            "tools.commands is empty; the process runner cannot launch any tool",
            "Map each tool name to an argv template such as [\"nmap\", \"-sV\", \"{target}\"]",
        );
    }
    for tool in tools.disabled.iter().filter(|tool| tools.commands.contains_key(*tool)) {
        warnings.push(format!("tool {tool} has a command but is disabled"));
    }

    Ok(warnings)
}

fn validate_task(
    config: &OrchestratorConfig,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    let task = &config.task;
    let retry = &config.retry;

    if task.workers == 0 {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.workers",
            reason: "must be at least 1".into(),
        });
    }
    if task.enqueue_attempts == 0 {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.enqueue_attempts",
            reason: "must be at least 1".into(),
        });
    }
    if task.hard_timeout_ms == 0 {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.hard_timeout",
            reason: "must be greater than zero".into(),
        });
    }
    if task.soft_timeout_ms > task.hard_timeout_ms {
        return Err(ConfigGuardRailError::SoftTimeoutExceedsHard {
            soft_ms: task.soft_timeout_ms,
            hard_ms: task.hard_timeout_ms,
        });
    }
    if task.soft_timeout_ms == task.hard_timeout_ms {
        warnings.push_with_hint(
            "task.soft_timeout equals task.hard_timeout; tools get no time to exit cleanly",
            "Leave a gap between the soft and hard timeouts",
        );
    }

    let lease_ms = u64::try_from(config.lease_ttl().as_millis()).unwrap_or(u64::MAX);
    if lease_ms <= task.hard_timeout_ms {
        return Err(ConfigGuardRailError::LeaseShorterThanRun {
            lease_ms,
            hard_ms: task.hard_timeout_ms,
        });
    }

    if !retry.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&retry.jitter_ratio) {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.jitter_ratio",
            reason: format!("must be between 0 and 1, got {}", retry.jitter_ratio),
        });
    }
    if retry.backoff_base_ms > retry.backoff_max_ms {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.backoff_base",
            reason: format!(
                "({}ms) exceeds task.backoff_max ({}ms)",
                retry.backoff_base_ms, retry.backoff_max_ms
            ),
        });
    }
    if config.lease.housekeeper_interval_ms == 0 || task.poll_interval_ms == 0 {
        return Err(ConfigGuardRailError::InvalidTaskSetting {
            field: "task.housekeeper_interval",
            reason: "housekeeper and poll intervals must be greater than zero".into(),
        });
    }
    if task.max_retries == 0 {
        warnings.push("task.max_retries is 0; failed tool runs are never retried");
    }

    Ok(())
}
