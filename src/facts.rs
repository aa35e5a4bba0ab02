//! Heuristic fact extraction over normalized text.
//!
//! [`FactExtractor::extract`] is pure: it never touches storage. The
//! orchestrator persists its output with [`crate::store::Store::replace_facts`].
//!
//! Rules are independent; one document can match any number of them.
//! Vital signs take only the first match per rule. Section rules scope a
//! list to the text between a header and the next known header (or the
//! end of the text), matching non-greedily so a following section is
//! never swallowed.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{ExtractedFact, FactType};

static BLOOD_PRESSURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:BP|Blood Pressure)[:\s]+(\d{2,3}/\d{2,3})").unwrap()
});

static HEART_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:HR|Heart Rate|Pulse)[:\s]+(\d{2,3})").unwrap()
});

static WEIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWeight[:\s]+(\d{2,3}(?:\.\d)?\s?(?:kg|lbs))\b").unwrap()
});

static ALLERGY_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bAllergies:(.*?)(?:Medications:|Assessment:|Plan:|$)").unwrap()
});

static ALLERGY_NEGATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:none|nkda|no known)\b").unwrap());

static MEDICATION_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\b(?:Medications|Current Meds|Rx):(.*?)(?:Allergies:|Assessment:|Plan:|$)")
        .unwrap()
});

static MEDICATION_NEGATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnone\b").unwrap());

/// Value of the allergy fact emitted when the section is negated.
pub const NO_KNOWN_ALLERGIES: &str = "NKDA";

/// Shortest list item kept from a section body.
const MIN_ITEM_CHARS: usize = 3;

/// One extraction heuristic.
pub trait FactRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, text: &str) -> Vec<ExtractedFact>;
}

/// A labelled vital sign; only the first occurrence counts.
pub struct VitalSignRule {
    name: &'static str,
    pattern: &'static LazyLock<Regex>,
    description: &'static str,
    confidence: f64,
    unit: Option<&'static str>,
}

impl VitalSignRule {
    pub fn blood_pressure() -> Self {
        Self {
            name: "blood_pressure",
            pattern: &BLOOD_PRESSURE,
            description: "Blood Pressure",
            confidence: 0.95,
            unit: None,
        }
    }

    pub fn heart_rate() -> Self {
        Self {
            name: "heart_rate",
            pattern: &HEART_RATE,
            description: "Heart Rate",
            confidence: 0.95,
            unit: Some("bpm"),
        }
    }

    pub fn weight() -> Self {
        Self {
            name: "weight",
            pattern: &WEIGHT,
            description: "Weight",
            confidence: 0.90,
            unit: None,
        }
    }
}

impl FactRule for VitalSignRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn extract(&self, text: &str) -> Vec<ExtractedFact> {
        let Some(caps) = self.pattern.captures(text) else {
            return Vec::new();
        };
        let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
            return Vec::new();
        };
        let value = match self.unit {
            Some(unit) => format!("{} {}", value.as_str(), unit),
            None => value.as_str().to_string(),
        };
        vec![ExtractedFact {
            fact_type: FactType::Vitals,
            value,
            description: Some(self.description.to_string()),
            confidence: self.confidence,
            evidence: whole.as_str().trim().to_string(),
        }]
    }
}

/// A header-scoped list section such as `Allergies:` or `Medications:`.
pub struct SectionListRule {
    name: &'static str,
    fact_type: FactType,
    section: &'static LazyLock<Regex>,
    negation: &'static LazyLock<Regex>,
    /// Fact emitted instead of the list when the body is negated.
    negated_fact: Option<(&'static str, &'static str, f64)>,
    confidence: f64,
}

impl SectionListRule {
    pub fn allergies() -> Self {
        Self {
            name: "allergies",
            fact_type: FactType::Allergy,
            section: &ALLERGY_SECTION,
            negation: &ALLERGY_NEGATION,
            negated_fact: Some((NO_KNOWN_ALLERGIES, "No Known Drug Allergies", 0.99)),
            confidence: 0.85,
        }
    }

    pub fn medications() -> Self {
        Self {
            name: "medications",
            fact_type: FactType::Medication,
            section: &MEDICATION_SECTION,
            negation: &MEDICATION_NEGATION,
            negated_fact: None,
            confidence: 0.85,
        }
    }
}

impl FactRule for SectionListRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn extract(&self, text: &str) -> Vec<ExtractedFact> {
        let Some(caps) = self.section.captures(text) else {
            return Vec::new();
        };
        let Some(body) = caps.get(1).map(|m| m.as_str()) else {
            return Vec::new();
        };

        if self.negation.is_match(body) {
            return match self.negated_fact {
                Some((value, description, confidence)) => vec![ExtractedFact {
                    fact_type: self.fact_type,
                    value: value.to_string(),
                    description: Some(description.to_string()),
                    confidence,
                    evidence: caps
                        .get(0)
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default(),
                }],
                None => Vec::new(),
            };
        }

        split_items(body)
            .map(|item| ExtractedFact {
                fact_type: self.fact_type,
                value: item.to_string(),
                description: None,
                confidence: self.confidence,
                evidence: item.to_string(),
            })
            .collect()
    }
}

fn split_items(body: &str) -> impl Iterator<Item = &str> {
    body.split([',', '\n'])
        .map(str::trim)
        .filter(|item| item.chars().count() >= MIN_ITEM_CHARS)
}

/// Runs an ordered set of [`FactRule`]s.
pub struct FactExtractor {
    rules: Vec<Box<dyn FactRule>>,
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FactExtractor {
    /// Extractor with the built-in vital sign and section rules.
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(VitalSignRule::blood_pressure()),
            Box::new(VitalSignRule::heart_rate()),
            Box::new(VitalSignRule::weight()),
            Box::new(SectionListRule::allergies()),
            Box::new(SectionListRule::medications()),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn FactRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Facts in rule order, then match order within a rule.
    pub fn extract(&self, text: &str) -> Vec<ExtractedFact> {
        self.rules.iter().flat_map(|r| r.extract(text)).collect()
    }
}
