//! Extracts findings from tool output.

use serde::Deserialize;
use warden_model::{FindingDraft, Severity};

/// Turns captured tool output into finding drafts.
pub trait FindingExtractor: Send + Sync {
    fn extract(&self, tool: &str, output: &str) -> Vec<FindingDraft>;
}

/// Generic contract for tools without a dedicated parser: one JSON object per
/// line with `severity`, `title` and optional `evidence`. Other lines are
/// ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesExtractor;

#[derive(Debug, Deserialize)]
struct RawFinding {
    severity: String,
    title: String,
    #[serde(default)]
    evidence: Option<serde_json::Value>,
}

impl FindingExtractor for JsonLinesExtractor {
    fn extract(&self, tool: &str, output: &str) -> Vec<FindingDraft> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| match serde_json::from_str::<RawFinding>(line) {
                Ok(raw) => Some(raw),
                Err(err) => {
                    tracing::trace!(target: "warden::execution", tool, %err, "skipping output line");
                    None
                }
            })
            .filter_map(|raw| {
                let severity = match raw.severity.parse::<Severity>() {
                    Ok(severity) => severity,
                    Err(err) => {
                        tracing::debug!(target: "warden::execution", tool, %err, "finding with unknown severity");
                        return None;
                    }
                };
                let evidence = match raw.evidence {
                    Some(serde_json::Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Some(FindingDraft {
                    severity,
                    title: raw.title,
                    evidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_lines_and_skips_noise() {
        let output = r#"
Starting scan...
{"severity": "high", "title": "Outdated TLS", "evidence": "TLSv1.0 enabled"}
{"severity": "bogus", "title": "ignored"}
{"severity": "Info", "title": "Open port", "evidence": {"port": 443}}
{"title": "no severity"}
done
"#;
        let findings = JsonLinesExtractor.extract("tlsscan", output);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].evidence, "TLSv1.0 enabled");
        assert_eq!(findings[1].severity, Severity::Info);
        assert_eq!(findings[1].evidence, r#"{"port":443}"#);
    }
}
