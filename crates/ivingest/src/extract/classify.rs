//! Keyword classifiers for finding severity and category.
//!
//! Both classifiers are deterministic: first keyword hit wins, scanning the
//! tables in declaration order over lowercased text.

use crate::model::{FindingCategory, FindingSeverity};

/// Severity keywords in precedence order.
const SEVERITY_TABLE: &[(FindingSeverity, &[&str])] = &[
    (
        FindingSeverity::Critical,
        &["critical", "urgent", "hazard", "danger", "emergency", "immediate"],
    ),
    (
        FindingSeverity::Major,
        &["moderate", "concern", "issue", "problem", "attention"],
    ),
    (
        FindingSeverity::Minor,
        &["minor", "cosmetic", "maintenance", "suggestion"],
    ),
];

/// Category keywords in precedence order.
const CATEGORY_TABLE: &[(FindingCategory, &[&str])] = &[
    (
        FindingCategory::Electrical,
        &["electrical", "wiring", "outlet", "breaker", "circuit", "panel"],
    ),
    (
        FindingCategory::Plumbing,
        &["plumbing", "pipe", "drain", "faucet", "water heater", "sewer", "leak"],
    ),
    (
        FindingCategory::Structural,
        &["structural", "foundation", "beam", "joist", "framing", "settlement"],
    ),
    (
        FindingCategory::Hvac,
        &["hvac", "furnace", "air condition", "heating", "cooling", "duct", "thermostat"],
    ),
    (
        FindingCategory::Roofing,
        &["roof", "shingle", "gutter", "flashing", "chimney"],
    ),
    (
        FindingCategory::Safety,
        &["safety", "smoke detector", "carbon monoxide", "radon", "mold", "asbestos", "railing"],
    ),
    (
        FindingCategory::Interior,
        &["interior", "drywall", "ceiling", "flooring", "wall", "window", "door"],
    ),
    (
        FindingCategory::Exterior,
        &["exterior", "siding", "deck", "fence", "driveway", "grading", "patio"],
    ),
];

/// Classifies finding severity; identical input yields identical severity.
pub fn classify_severity(text: &str) -> FindingSeverity {
    let lowered = text.to_lowercase();
    for (severity, keywords) in SEVERITY_TABLE {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return *severity;
        }
    }
    FindingSeverity::Informational
}

/// Classifies finding category; falls through to `Other`.
pub fn classify_category(text: &str) -> FindingCategory {
    let lowered = text.to_lowercase();
    for (category, keywords) in CATEGORY_TABLE {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return *category;
        }
    }
    FindingCategory::Other
}

/// True when the text mentions any category or severity keyword at all.
pub fn mentions_finding_keyword(text: &str) -> bool {
    classify_category(text) != FindingCategory::Other
        || classify_severity(text) != FindingSeverity::Informational
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_first_hit_wins() {
        assert_eq!(
            classify_severity("critical electrical hazard"),
            FindingSeverity::Critical
        );
        // "hazard" outranks "concern" because critical keywords scan first.
        assert_eq!(
            classify_severity("a concern that is also a hazard"),
            FindingSeverity::Critical
        );
        assert_eq!(
            classify_severity("moderate wear on the deck"),
            FindingSeverity::Major
        );
        assert_eq!(
            classify_severity("cosmetic scuff marks"),
            FindingSeverity::Minor
        );
        assert_eq!(
            classify_severity("the lawn was freshly mowed"),
            FindingSeverity::Informational
        );
    }

    #[test]
    fn test_severity_is_deterministic() {
        let text = "urgent problem with minor cosmetic damage";
        let first = classify_severity(text);
        for _ in 0..10 {
            assert_eq!(classify_severity(text), first);
        }
        assert_eq!(first, FindingSeverity::Critical);
    }

    #[test]
    fn test_category_table() {
        assert_eq!(
            classify_category("exposed wiring at the main panel"),
            FindingCategory::Electrical
        );
        assert_eq!(
            classify_category("leak under the kitchen sink"),
            FindingCategory::Plumbing
        );
        assert_eq!(
            classify_category("missing shingles on the south slope"),
            FindingCategory::Roofing
        );
        assert_eq!(
            classify_category("mold in the crawlspace"),
            FindingCategory::Safety
        );
        assert_eq!(
            classify_category("overgrown hedge"),
            FindingCategory::Other
        );
    }

    #[test]
    fn test_category_precedence() {
        // "panel" (electrical) beats "wall" (interior) by table order.
        assert_eq!(
            classify_category("panel mounted on the wall"),
            FindingCategory::Electrical
        );
    }

    #[test]
    fn test_mentions_finding_keyword() {
        assert!(mentions_finding_keyword("minor crack"));
        assert!(mentions_finding_keyword("gutter needs cleaning"));
        assert!(!mentions_finding_keyword("the weather was sunny"));
    }
}
