//! Deterministic field extraction from parsed report text.

pub mod classify;
pub mod patterns;

use regex::Regex;

use crate::model::{Finding, InspectionRecord};
use crate::parser::ParserOutput;

pub use classify::{classify_category, classify_severity};

/// Turns raw parser output into the canonical inspection record by applying
/// ordered pattern rules. First match wins throughout; identical input text
/// always yields an identical record apart from finding ids.
pub struct FieldExtractor {
    property: patterns::PropertyPatterns,
    inspector: patterns::InspectorPatterns,
    cost: Regex,
    location: Regex,
    recommendation: Regex,
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self {
            property: patterns::PropertyPatterns::new(),
            inspector: patterns::InspectorPatterns::new(),
            cost: Regex::new(r"\$\s*([\d,]+(?:\.\d{1,2})?)").expect("cost pattern"),
            location: Regex::new(r"(?i)\b(?:at|near)\s+(?:the\s+)?(?P<loc>[a-z0-9][a-z0-9 \-]{2,60})")
                .expect("location pattern"),
            recommendation: Regex::new(r"(?i)recommend(?:ed|ation)?s?\s*[:\-]?\s*(?P<rec>.+)")
                .expect("recommendation pattern"),
        }
    }

    pub fn extract(&self, output: &ParserOutput) -> InspectionRecord {
        let text = normalize_whitespace(&output.text);

        let property = self.property.extract(&text);
        let inspector = self.inspector.extract(&text);
        let findings = self.extract_findings(&text);

        InspectionRecord {
            property,
            inspector,
            findings,
        }
    }

    /// One candidate finding per line that mentions a category or severity
    /// keyword and is not a property/inspector header line.
    fn extract_findings(&self, text: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.len() < 8 {
                continue;
            }
            if self.property.is_address_line(line) || self.inspector.is_inspector_line(line) {
                continue;
            }
            if !classify::mentions_finding_keyword(line) {
                continue;
            }

            let severity = classify_severity(line);
            let category = classify_category(line);

            let location = self
                .location
                .captures(line)
                .and_then(|c| c.name("loc"))
                .map(|m| m.as_str().trim().to_string());

            let recommendation = self
                .recommendation
                .captures(line)
                .and_then(|c| c.name("rec"))
                .map(|m| m.as_str().trim().to_string());

            let estimated_cost = self
                .cost
                .captures(line)
                .and_then(|c| c[1].replace(',', "").parse::<f64>().ok());

            findings.push(Finding {
                id: uuid::Uuid::new_v4().to_string(),
                category,
                severity,
                title: truncate_title(line),
                description: line.to_string(),
                location,
                recommendation,
                estimated_cost,
                priority: severity.priority(),
            });
        }

        findings
    }
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapses runs of spaces and tabs; newlines are kept as line separators.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut last_was_space = true;
        for c in line.chars() {
            if c == ' ' || c == '\t' {
                if !last_was_space {
                    out.push(' ');
                }
                last_was_space = true;
            } else {
                out.push(c);
                last_was_space = false;
            }
        }
        while out.ends_with(' ') {
            out.pop();
        }
        out.push('\n');
    }
    out
}

const MAX_TITLE_LEN: usize = 80;

fn truncate_title(line: &str) -> String {
    if line.len() <= MAX_TITLE_LEN {
        return line.to_string();
    }
    let mut end = MAX_TITLE_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end].trim_end())
}
