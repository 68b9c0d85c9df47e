//! Tool authorization by risk level.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use warden_model::{DecisionReason, RiskLevel, normalize_tool_name};

/// Tool risk levels and approval rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicyConfig {
    /// Risk per tool name.
    pub risk_table: BTreeMap<String, RiskLevel>,
    /// Risk assumed for tools missing from `risk_table`.
    pub default_risk: RiskLevel,
    /// Tools that are never run.
    pub disabled: Vec<String>,
    /// Tools at or above this risk need explicit approval.
    pub approval_threshold: RiskLevel,
    /// Rate-limit tokens charged per run; tools not listed cost 1.
    pub rate_cost: BTreeMap<String, u32>,
    /// argv templates for the process runner; `{target}` is substituted.
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            risk_table: BTreeMap::new(),
            default_risk: RiskLevel::Medium,
            disabled: Vec::new(),
            approval_threshold: RiskLevel::High,
            rate_cost: BTreeMap::new(),
            commands: BTreeMap::new(),
        }
    }
}

/// Result of checking a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVerdict {
    /// The tool may run.
    pub allowed: bool,
    /// The tool's effective risk.
    pub risk: RiskLevel,
    /// Why, in the shared decision vocabulary.
    pub reason: DecisionReason,
    /// Explanation for denials.
    pub detail: Option<String>,
}

/// Decides whether a tool may run, given its risk and any approval.
#[derive(Debug, Clone)]
pub struct ToolAuthorizer {
    risk_table: HashMap<String, RiskLevel>,
    default_risk: RiskLevel,
    disabled: HashSet<String>,
    approval_threshold: RiskLevel,
    rate_cost: HashMap<String, u32>,
}

impl ToolAuthorizer {
    /// Normalizes every tool name in the configuration.
    pub fn new(config: &ToolPolicyConfig) -> Self {
        Self {
            risk_table: config
                .risk_table
                .iter()
                .map(|(tool, risk)| (normalize_tool_name(tool), *risk))
                .collect(),
            default_risk: config.default_risk,
            disabled: config
                .disabled
                .iter()
                .map(|tool| normalize_tool_name(tool))
                .collect(),
            approval_threshold: config.approval_threshold,
            rate_cost: config
                .rate_cost
                .iter()
                .map(|(tool, cost)| (normalize_tool_name(tool), *cost))
                .collect(),
        }
    }

    /// The configured risk, or the default for unknown tools.
    pub fn risk_of(&self, tool: &str) -> RiskLevel {
        self.risk_table
            .get(&normalize_tool_name(tool))
            .copied()
            .unwrap_or(self.default_risk)
    }

    /// Rate-limit tokens charged per run.
    pub fn cost_of(&self, tool: &str) -> u32 {
        self.rate_cost
            .get(&normalize_tool_name(tool))
            .copied()
            .unwrap_or(1)
    }

    /// Refuses disabled tools and, without approval, tools at or above the
    /// approval threshold.
    pub fn is_allowed(&self, tool: &str, explicit_approval: bool) -> ToolVerdict {
        let name = normalize_tool_name(tool);
        let known = self.risk_table.get(&name).copied();
        let risk = known.unwrap_or(self.default_risk);

        if self.disabled.contains(&name) {
            return ToolVerdict {
                allowed: false,
                risk,
                reason: DecisionReason::ToolDenied,
                detail: Some(format!("tool '{name}' is disabled")),
            };
        }

        // An unknown tool under a high default risk is never trusted blindly,
        // whatever the threshold says.
        let needs_approval = risk >= self.approval_threshold
            || (known.is_none() && self.default_risk >= RiskLevel::High);
        if needs_approval && !explicit_approval {
            return ToolVerdict {
                allowed: false,
                risk,
                reason: DecisionReason::ToolDenied,
                detail: Some(format!(
                    "tool '{name}' has {risk} risk and requires explicit approval"
                )),
            };
        }

        ToolVerdict {
            allowed: true,
            risk,
            reason: DecisionReason::Allowed,
            detail: None,
        }
    }
}
