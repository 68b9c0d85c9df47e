use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;

use crate::error::{ModelError, Result};
use crate::ids::TargetId;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Shape of a target value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TargetKind {
    Ip,
    Cidr,
    Domain,
}

/// Operator-assigned authorization scope of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AuthorizationScope {
    #[default]
    InScope,
    OutOfScope,
    RequiresApproval,
}

impl AuthorizationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationScope::InScope => "in_scope",
            AuthorizationScope::OutOfScope => "out_of_scope",
            AuthorizationScope::RequiresApproval => "requires_approval",
        }
    }
}

impl FromStr for AuthorizationScope {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_scope" => Ok(Self::InScope),
            "out_of_scope" => Ok(Self::OutOfScope),
            "requires_approval" => Ok(Self::RequiresApproval),
            other => Err(ModelError::UnknownVariant {
                kind: "authorization scope",
                value: other.to_string(),
            }),
        }
    }
}

/// A parsed, normalized target value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddress {
    Ip(IpAddr),
    Network(IpNetwork),
    Domain(String),
}

impl TargetAddress {
    /// Parses an IP address, CIDR block, or hostname.
    ///
    /// Hostnames are lower-cased and lose a trailing dot. Bracketed IPv6
    /// literals (`[::1]`) are accepted. Numeric spellings that resolvers
    /// read as IPv4 (`167772161`, `10.1`, `012.1.2.3`, `0xa.1.2.3`) are
    /// rejected rather than treated as hostnames, since they would slip
    /// past IP rules.
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(ModelError::invalid_target(raw, "empty value"));
        }

        if value.contains('/') {
            return IpNetwork::from_str(value)
                .map(TargetAddress::Network)
                .map_err(|err| {
                    ModelError::invalid_target(raw, format!("bad CIDR: {err}"))
                });
        }

        let unbracketed = value
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .unwrap_or(value);
        if let Ok(ip) = IpAddr::from_str(unbracketed) {
            return Ok(TargetAddress::Ip(ip));
        }

        let domain = normalize_domain(value);
        // `10.1.2.3.` is still an address.
        if let Ok(ip) = IpAddr::from_str(&domain) {
            return Ok(TargetAddress::Ip(ip));
        }
        validate_domain(&domain).map_err(|reason| {
            ModelError::invalid_target(raw, reason)
        })?;
        Ok(TargetAddress::Domain(domain))
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            TargetAddress::Ip(_) => TargetKind::Ip,
            TargetAddress::Network(_) => TargetKind::Cidr,
            TargetAddress::Domain(_) => TargetKind::Domain,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, TargetAddress::Domain(_))
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddress::Ip(ip) => write!(f, "{ip}"),
            TargetAddress::Network(net) => write!(f, "{net}"),
            TargetAddress::Domain(domain) => f.write_str(domain),
        }
    }
}

/// Lower-cases a hostname and strips a single trailing dot.
pub fn normalize_domain(value: &str) -> String {
    let lowered = value.trim().to_ascii_lowercase();
    match lowered.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => lowered,
    }
}

fn validate_domain(domain: &str) -> std::result::Result<(), String> {
    if domain.is_empty() {
        return Err("empty hostname".into());
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(format!("hostname longer than {MAX_DOMAIN_LEN} bytes"));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err("empty label".into());
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!("label '{label}' longer than {MAX_LABEL_LEN}"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{label}' starts or ends with '-'"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(format!("label '{label}' has invalid characters"));
        }
        if label.len() > 1 && label.starts_with('0') && is_numeric_label(label) {
            return Err(format!("label '{label}' is an octal or hex number"));
        }
    }
    // RFC 3696 section 2: a top-level label is never all-numeric.
    if domain.rsplit('.').next().is_some_and(is_numeric_label) {
        return Err("all-numeric top-level label reads as an IPv4 address".into());
    }
    Ok(())
}

/// Decimal digits, or a `0x` prefix followed by hex digits.
fn is_numeric_label(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    match label.strip_prefix("0x") {
        Some(hex) => hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// A scan target. Immutable once referenced by a job, except for operator
/// scope changes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Target {
    pub id: TargetId,
    pub value: String,
    pub kind: TargetKind,
    pub scope: AuthorizationScope,
    pub created_at: DateTime<Utc>,
}

impl Target {
    /// The stored kind is derived from the stored value, so
    /// [`Target::address`] always agrees with it.
    pub fn new(address: &TargetAddress, scope: AuthorizationScope) -> Self {
        let value = address.to_string();
        let kind = TargetAddress::parse(&value)
            .map(|parsed| parsed.kind())
            .unwrap_or_else(|_| address.kind());
        Self {
            id: TargetId::new(),
            value,
            kind,
            scope,
            created_at: Utc::now(),
        }
    }

    pub fn address(&self) -> Result<TargetAddress> {
        TargetAddress::parse(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_cidr_and_domain_values() {
        assert_eq!(
            TargetAddress::parse("10.1.2.3").unwrap().kind(),
            TargetKind::Ip
        );
        assert_eq!(
            TargetAddress::parse("[2001:db8::1]").unwrap().kind(),
            TargetKind::Ip
        );
        assert_eq!(
            TargetAddress::parse("10.0.0.0/8").unwrap().kind(),
            TargetKind::Cidr
        );
        assert_eq!(
            TargetAddress::parse("Scan.Example.COM.").unwrap(),
            TargetAddress::Domain("scan.example.com".into())
        );
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["", "   ", "10.0.0.0/33", "bad_host", "-lead.example", "a..b"] {
            assert!(
                TargetAddress::parse(bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn numeric_ipv4_spellings_are_not_hostnames() {
        for numeric in [
            "167772161",
            "10.1",
            "012.1.2.3",
            "0xa.1.2.3",
            "10.0x1",
            "0x0a000001",
            "1.2.3.04",
        ] {
            assert!(
                TargetAddress::parse(numeric).is_err(),
                "{numeric:?} should be rejected"
            );
        }
        // Digits inside a real hostname are fine.
        assert!(TargetAddress::parse("10.example.com").unwrap().is_domain());
        assert!(TargetAddress::parse("host1.example2.com").unwrap().is_domain());
    }

    #[test]
    fn trailing_dot_ip_is_stored_as_an_ip() {
        let address = TargetAddress::parse("10.1.2.3.").unwrap();
        assert_eq!(address, TargetAddress::Ip("10.1.2.3".parse().unwrap()));

        let target = Target::new(&address, AuthorizationScope::InScope);
        assert_eq!(target.value, "10.1.2.3");
        assert_eq!(target.kind, TargetKind::Ip);
        assert_eq!(target.address().unwrap().kind(), target.kind);
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in [
            AuthorizationScope::InScope,
            AuthorizationScope::OutOfScope,
            AuthorizationScope::RequiresApproval,
        ] {
            assert_eq!(scope.as_str().parse::<AuthorizationScope>(), Ok(scope));
        }
    }
}
