//! Target authorization against allow and deny rules.
//!
//! Rules are CIDR blocks, single IP addresses, exact hostnames, or wildcard
//! hostnames (`*.example.com`, which matches subdomains but not the apex).
//! Deny rules always win. When an allow list is configured, anything not on
//! it is rejected; otherwise targets are allowed by default.

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use warden_model::{DecisionReason, TargetAddress};

use super::PolicyError;

/// Allow and deny rules, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicyConfig {
    /// When non-empty, targets must match one of these.
    pub allow_list: Vec<String>,
    /// Targets overlapping any of these are refused.
    pub deny_list: Vec<String>,
    /// Default-allowed targets additionally need operator approval.
    pub require_explicit_approval: bool,
}

/// A parsed allow or deny rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRule {
    /// A CIDR block; single addresses become host networks.
    Network(IpNetwork),
    /// One hostname.
    Exact(String),
    /// Domain suffix without the leading `*.`.
    Wildcard(String),
}

impl NetworkRule {
    /// Parses a rule, rejecting anything that is not a CIDR, an IP or a
    /// hostname with an optional `*.` prefix.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let invalid = |reason: String| PolicyError::InvalidRule {
            rule: raw.to_string(),
            reason,
        };

        let value = raw.trim();
        if let Some(suffix) = value.strip_prefix("*.") {
            return match TargetAddress::parse(suffix) {
                Ok(TargetAddress::Domain(domain)) => {
                    Ok(NetworkRule::Wildcard(domain))
                }
                Ok(_) => Err(invalid("wildcards only apply to hostnames".into())),
                Err(err) => Err(invalid(err.to_string())),
            };
        }

        match TargetAddress::parse(value).map_err(|err| invalid(err.to_string()))? {
            TargetAddress::Network(net) => Ok(NetworkRule::Network(net)),
            TargetAddress::Ip(ip) => host_network(ip)
                .map(NetworkRule::Network)
                .map_err(|err| invalid(err.to_string())),
            TargetAddress::Domain(domain) => Ok(NetworkRule::Exact(domain)),
        }
    }

    /// True when the rule covers any part of the target. Used for deny rules,
    /// so a CIDR target that merely overlaps a denied range is rejected.
    pub fn overlaps(&self, target: &TargetAddress) -> bool {
        match (self, target) {
            (NetworkRule::Network(rule), TargetAddress::Network(net)) => {
                same_family(rule, net)
                    && (rule.contains(net.network())
                        || net.contains(rule.network()))
            }
            _ => self.covers(target),
        }
    }

    /// True when the rule covers the whole target. Used for allow rules.
    pub fn covers(&self, target: &TargetAddress) -> bool {
        match (self, target) {
            (NetworkRule::Network(rule), TargetAddress::Ip(ip)) => {
                rule.contains(*ip)
            }
            (NetworkRule::Network(rule), TargetAddress::Network(net)) => {
                same_family(rule, net)
                    && rule.prefix() <= net.prefix()
                    && rule.contains(net.network())
            }
            (NetworkRule::Exact(rule), TargetAddress::Domain(domain)) => {
                rule == domain
            }
            (NetworkRule::Wildcard(suffix), TargetAddress::Domain(domain)) => {
                domain.len() > suffix.len()
                    && domain.ends_with(suffix.as_str())
                    && domain[..domain.len() - suffix.len()].ends_with('.')
            }
            // Hostnames are never resolved, so IP rules do not apply to them
            // and host rules do not apply to addresses.
            _ => false,
        }
    }
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkRule::Network(net) => write!(f, "{net}"),
            NetworkRule::Exact(domain) => f.write_str(domain),
            NetworkRule::Wildcard(suffix) => write!(f, "*.{suffix}"),
        }
    }
}

fn host_network(ip: IpAddr) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix)
}

fn same_family(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Result of checking a target against the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkVerdict {
    /// The target may be scanned.
    pub allowed: bool,
    /// Why, in the shared decision vocabulary.
    pub reason: DecisionReason,
    /// Rule that decided the verdict; `None` on the default-allow path.
    pub matched_rule: Option<String>,
}

impl NetworkVerdict {
    /// A human-readable explanation for logs and job failures.
    pub fn detail(&self, target: &TargetAddress) -> String {
        match (&self.reason, &self.matched_rule) {
            (DecisionReason::NetworkDenied, Some(rule)) => {
                format!("target {target} matches deny rule {rule}")
            }
            (DecisionReason::NotInAllowlist, _) => {
                format!("target {target} is not covered by the allow list")
            }
            (DecisionReason::ApprovalRequired, _) => {
                format!("target {target} requires explicit approval")
            }
            (_, Some(rule)) => format!("target {target} allowed by {rule}"),
            _ => format!("target {target} allowed by default"),
        }
    }
}

/// Decides whether a target may be scanned.
#[derive(Debug, Clone)]
pub struct NetworkAuthorizer {
    allow: Vec<NetworkRule>,
    deny: Vec<NetworkRule>,
    require_explicit_approval: bool,
}

impl NetworkAuthorizer {
    /// Parses every rule; one bad rule fails the whole configuration.
    pub fn from_config(config: &NetworkPolicyConfig) -> Result<Self, PolicyError> {
        let parse_all = |rules: &[String]| {
            rules
                .iter()
                .map(|rule| NetworkRule::parse(rule))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: parse_all(&config.allow_list)?,
            deny: parse_all(&config.deny_list)?,
            require_explicit_approval: config.require_explicit_approval,
        })
    }

    /// Checks the rules, ignoring approval requirements.
    pub fn is_allowed(&self, target: &TargetAddress) -> NetworkVerdict {
        if let Some(rule) = self.deny.iter().find(|rule| rule.overlaps(target)) {
            return NetworkVerdict {
                allowed: false,
                reason: DecisionReason::NetworkDenied,
                matched_rule: Some(rule.to_string()),
            };
        }

        if !self.allow.is_empty() {
            return match self.allow.iter().find(|rule| rule.covers(target)) {
                Some(rule) => NetworkVerdict {
                    allowed: true,
                    reason: DecisionReason::Allowed,
                    matched_rule: Some(rule.to_string()),
                },
                None => NetworkVerdict {
                    allowed: false,
                    reason: DecisionReason::NotInAllowlist,
                    matched_rule: None,
                },
            };
        }

        NetworkVerdict {
            allowed: true,
            reason: DecisionReason::Allowed,
            matched_rule: None,
        }
    }

    /// [`Self::is_allowed`] plus the explicit-approval requirement for targets
    /// that only pass through the default-allow path.
    pub fn authorize(
        &self,
        target: &TargetAddress,
        target_approved: bool,
    ) -> NetworkVerdict {
        let verdict = self.is_allowed(target);
        if verdict.allowed
            && verdict.matched_rule.is_none()
            && self.require_explicit_approval
            && !target_approved
        {
            return NetworkVerdict {
                allowed: false,
                reason: DecisionReason::ApprovalRequired,
                matched_rule: None,
            };
        }
        verdict
    }
}
