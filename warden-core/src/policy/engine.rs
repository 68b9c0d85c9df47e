//! The policy engine composes the authorizers, the concurrency tracker and
//! the rate limiter into a single admission decision.
//!
//! Job-level admission checks the target and takes a global job slot.
//! Tool-level admission checks the tool, then takes a global tool slot, a
//! per-job tool slot and finally rate-limit tokens. Either everything is
//! acquired or nothing is: slots taken before a later check fails are
//! released before the denial is returned, because they are held as RAII
//! permits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warden_model::{
    AuthorizationScope, DecisionReason, PolicyDecision, ScanJob, Target,
    TargetAddress, normalize_tool_name,
};

use super::concurrency::{
    ConcurrencyConfig, ConcurrencyTracker, CounterKind, JobSlot, ToolSlots,
};
use super::network::{NetworkAuthorizer, NetworkPolicyConfig};
use super::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiter};
use super::tools::{ToolAuthorizer, ToolPolicyConfig};
use super::PolicyError;
use crate::error::{Result, ValidationError};

/// Every admission policy setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Token-bucket rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Concurrency ceilings.
    pub concurrency: ConcurrencyConfig,
    /// Allow and deny rules for targets.
    pub network: NetworkPolicyConfig,
    /// Tool risk levels and approval rules.
    pub tools: ToolPolicyConfig,
}

/// Capacity held on behalf of an admitted job or tool run.
#[derive(Debug)]
pub enum AdmissionPermit {
    /// A global job slot.
    Job(JobSlot),
    /// Global and per-job tool slots.
    Tool(ToolSlots),
}

/// Outcome of an admission check.
#[derive(Debug)]
pub struct Admission {
    /// Allow, or the denial reason.
    pub decision: PolicyDecision,
    /// Held capacity; present only when allowed.
    pub permit: Option<AdmissionPermit>,
}

impl Admission {
    fn allowed(permit: AdmissionPermit) -> Self {
        Self {
            decision: PolicyDecision::allow(),
            permit: Some(permit),
        }
    }

    fn denied(decision: PolicyDecision) -> Self {
        Self {
            decision,
            permit: None,
        }
    }

    /// Whether the check passed.
    pub fn is_allowed(&self) -> bool {
        self.decision.allowed
    }

    /// The job slot, if this admitted a job.
    pub fn into_job_slot(self) -> Option<JobSlot> {
        match self.permit {
            Some(AdmissionPermit::Job(slot)) => Some(slot),
            _ => None,
        }
    }

    /// The tool slots, if this admitted a tool run.
    pub fn into_tool_slots(self) -> Option<ToolSlots> {
        match self.permit {
            Some(AdmissionPermit::Tool(slots)) => Some(slots),
            _ => None,
        }
    }
}

/// Runs every admission check in a fixed order and holds the capacity
/// it grants.
#[derive(Debug)]
pub struct PolicyEngine {
    rate_config: RateLimitConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    tracker: Arc<ConcurrencyTracker>,
    network: NetworkAuthorizer,
    tools: ToolAuthorizer,
}

impl PolicyEngine {
    /// Engine with a process-local rate limiter.
    pub fn new(config: &PolicyConfig) -> std::result::Result<Self, PolicyError> {
        let limiter = Arc::new(InMemoryRateLimiter::new(&config.rate_limit));
        Self::with_rate_limiter(config, limiter)
    }

    /// Engine with a caller-supplied rate limiter, such as a shared Redis one.
    pub fn with_rate_limiter(
        config: &PolicyConfig,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> std::result::Result<Self, PolicyError> {
        validate_limits(config)?;
        Ok(Self {
            rate_config: config.rate_limit.clone(),
            rate_limiter,
            tracker: Arc::new(ConcurrencyTracker::new(config.concurrency)),
            network: NetworkAuthorizer::from_config(&config.network)?,
            tools: ToolAuthorizer::new(&config.tools),
        })
    }

    /// The concurrency tracker.
    pub fn tracker(&self) -> &Arc<ConcurrencyTracker> {
        &self.tracker
    }

    /// The network authorizer.
    pub fn network(&self) -> &NetworkAuthorizer {
        &self.network
    }

    /// The tool authorizer.
    pub fn tools(&self) -> &ToolAuthorizer {
        &self.tools
    }

    /// Synchronous submission checks. Returns the parsed target and the
    /// normalized tool names.
    pub fn validate_submission<S: AsRef<str>>(
        &self,
        target: &str,
        tools: &[S],
    ) -> std::result::Result<(TargetAddress, Vec<String>), ValidationError> {
        if tools.is_empty() {
            return Err(ValidationError::EmptyToolList);
        }

        let mut normalized = Vec::with_capacity(tools.len());
        for (index, tool) in tools.iter().enumerate() {
            let name = normalize_tool_name(tool.as_ref());
            if name.is_empty() {
                return Err(ValidationError::BlankToolName { index });
            }
            self.rate_config
                .validate_cost(&name, self.tools.cost_of(&name))?;
            normalized.push(name);
        }

        let address =
            TargetAddress::parse(target).map_err(ValidationError::InvalidTarget)?;
        Ok((address, normalized))
    }

    /// Job-level admission when `tool` is `None`, tool-level otherwise.
    pub async fn evaluate(
        &self,
        job: &ScanJob,
        target: &Target,
        tool: Option<&str>,
    ) -> Result<Admission> {
        match tool {
            None => self.evaluate_job(job, target),
            Some(tool) => self.evaluate_tool(job, target, tool).await,
        }
    }

    /// Checks the target and takes a global job slot.
    pub fn evaluate_job(&self, job: &ScanJob, target: &Target) -> Result<Admission> {
        if let Some(decision) = self.target_denial(job, target)? {
            return Ok(self.deny(job, None, decision));
        }

        match self.tracker.acquire_job_slot() {
            Some(slot) => Ok(Admission::allowed(AdmissionPermit::Job(slot))),
            None => {
                let limit = self.tracker.limits().max_global_jobs;
                Ok(self.deny(
                    job,
                    None,
                    PolicyDecision::deny(
                        DecisionReason::ConcurrencyExhausted,
                        format!("global job limit of {limit} reached"),
                    ),
                ))
            }
        }
    }

    /// Checks the target, the tool, concurrency and the rate limit, in that
    /// order, and takes tool slots. Denials are logged.
    pub async fn evaluate_tool(
        &self,
        job: &ScanJob,
        target: &Target,
        tool: &str,
    ) -> Result<Admission> {
        // Re-checked per run so operator scope changes reach queued work.
        if let Some(decision) = self.target_denial(job, target)? {
            return Ok(self.deny(job, Some(tool), decision));
        }

        let verdict = self.tools.is_allowed(tool, job.approvals.tool_approved(tool));
        if !verdict.allowed {
            let detail = verdict.detail.unwrap_or_default();
            return Ok(self.deny(
                job,
                Some(tool),
                PolicyDecision::deny(verdict.reason, detail),
            ));
        }

        let slots = match self.tracker.acquire_tool_slots(job.id) {
            Ok(slots) => slots,
            Err(counter) => {
                let limits = self.tracker.limits();
                let detail = match counter {
                    CounterKind::JobTools(_) => format!(
                        "job already runs {} tools",
                        limits.max_tools_per_job
                    ),
                    _ => format!(
                        "global tool limit of {} reached",
                        limits.max_global_tools
                    ),
                };
                return Ok(self.deny(
                    job,
                    Some(tool),
                    PolicyDecision::deny(
                        DecisionReason::ConcurrencyExhausted,
                        detail,
                    ),
                ));
            }
        };

        let cost = self.tools.cost_of(tool);
        let key = self.rate_config.bucket_key(&job.target_value);
        let rate = self.rate_limiter.try_acquire(&key, cost).await?;
        if !rate.granted {
            drop(slots);
            let mut decision = PolicyDecision::deny(
                DecisionReason::RateLimited,
                format!("bucket {key} has fewer than {cost} tokens"),
            );
            if let Some(wait) = rate.wait_hint {
                decision = decision.with_retry_after(wait);
            }
            return Ok(self.deny(job, Some(tool), decision));
        }

        Ok(Admission::allowed(AdmissionPermit::Tool(slots)))
    }

    fn target_denial(
        &self,
        job: &ScanJob,
        target: &Target,
    ) -> Result<Option<PolicyDecision>> {
        let address = target.address()?;
        let verdict = self.network.authorize(&address, job.approvals.target);
        if !verdict.allowed {
            return Ok(Some(PolicyDecision::deny(
                verdict.reason,
                verdict.detail(&address),
            )));
        }

        let decision = match target.scope {
            AuthorizationScope::InScope => None,
            AuthorizationScope::OutOfScope => Some(PolicyDecision::deny(
                DecisionReason::TargetOutOfScope,
                format!("target {address} is marked out of scope"),
            )),
            AuthorizationScope::RequiresApproval if !job.approvals.target => {
                Some(PolicyDecision::deny(
                    DecisionReason::ApprovalRequired,
                    format!("target {address} requires explicit approval"),
                ))
            }
            AuthorizationScope::RequiresApproval => None,
        };
        Ok(decision)
    }

    fn deny(
        &self,
        job: &ScanJob,
        tool: Option<&str>,
        decision: PolicyDecision,
    ) -> Admission {
        tracing::debug!(
            target: "warden::policy",
            job = %job.id,
            tool = tool.unwrap_or("-"),
            reason = %decision.reason,
            detail = decision.detail.as_deref().unwrap_or(""),
            "admission denied"
        );
        Admission::denied(decision)
    }
}

fn validate_limits(config: &PolicyConfig) -> std::result::Result<(), PolicyError> {
    let rate = &config.rate_limit;
    if !rate.tokens_per_second.is_finite() || rate.tokens_per_second <= 0.0 {
        return Err(PolicyError::InvalidSetting {
            field: "rate_limit.tokens_per_second",
            reason: format!("must be a positive number, got {}", rate.tokens_per_second),
        });
    }
    if rate.burst == 0 {
        return Err(PolicyError::InvalidSetting {
            field: "rate_limit.burst",
            reason: "must be at least 1".into(),
        });
    }

    let limits = &config.concurrency;
    for (field, value) in [
        ("concurrency.max_global_jobs", limits.max_global_jobs),
        ("concurrency.max_global_tools", limits.max_global_tools),
        ("concurrency.max_tools_per_job", limits.max_tools_per_job),
    ] {
        if value == 0 {
            return Err(PolicyError::InvalidSetting {
                field,
                reason: "must be at least 1".into(),
            });
        }
    }
    Ok(())
}
