//! Label-confidence policy.
//!
//! Thresholds are parsed once at configuration time from strings of the form
//! `"Photography:98.0,Computer Hardware:40"`. Evaluation is pure and stops at
//! the first violation: minimum rules in declaration order, then maximum
//! rules, each checked against labels in the order the capability returned
//! them.

use crate::types::Label;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

const CONFIDENCE_MIN: f32 = 0.0;
const CONFIDENCE_MAX: f32 = 100.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("policy entry {entry:?} is not of the form label:threshold")]
    MalformedEntry { entry: String },
    #[error("threshold {value:?} for label {label:?} is not a decimal number")]
    InvalidThreshold { label: String, value: String },
    #[error("threshold {value} for label {label:?} is outside [0, 100]")]
    OutOfRange { label: String, value: f32 },
    #[error("label {label:?} is listed more than once")]
    DuplicateLabel { label: String },
}

/// Ordered `label -> threshold` rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdMap {
    rules: Vec<(String, f32)>,
}

impl ThresholdMap {
    /// Parse a comma-separated list of `label:threshold` entries.
    ///
    /// Whitespace around entries is trimmed and empty entries are skipped,
    /// so `""` yields an empty map. Anything else that does not parse is an
    /// error; nothing is silently dropped.
    pub fn parse(spec: &str) -> Result<Self, PolicyError> {
        let mut pairs = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (label, value) =
                entry
                    .rsplit_once(':')
                    .ok_or_else(|| PolicyError::MalformedEntry {
                        entry: entry.to_string(),
                    })?;
            let label = label.trim();
            let value = value.trim();
            if label.is_empty() {
                return Err(PolicyError::MalformedEntry {
                    entry: entry.to_string(),
                });
            }
            let threshold: f32 = value.parse().map_err(|_| PolicyError::InvalidThreshold {
                label: label.to_string(),
                value: value.to_string(),
            })?;
            pairs.push((label.to_string(), threshold));
        }
        Self::from_pairs(pairs)
    }

    /// Build a map from already-typed pairs, checking range and uniqueness.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        let mut rules: Vec<(String, f32)> = Vec::new();
        for (label, threshold) in pairs {
            let label = label.into();
            if !(CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&threshold) {
                return Err(PolicyError::OutOfRange {
                    label,
                    value: threshold,
                });
            }
            if rules.iter().any(|(existing, _)| *existing == label) {
                return Err(PolicyError::DuplicateLabel { label });
            }
            rules.push((label, threshold));
        }
        Ok(Self { rules })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.rules.iter().map(|(label, t)| (label.as_str(), *t))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The first rule a label result broke.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "bound", rename_all = "snake_case")]
pub enum Violation {
    BelowMinimum {
        label: String,
        threshold: f32,
        actual: f32,
    },
    AboveMaximum {
        label: String,
        threshold: f32,
        actual: f32,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinimum {
                label,
                threshold,
                actual,
            } => write!(f, "label {label} has confidence less than {threshold} ({actual})"),
            Self::AboveMaximum {
                label,
                threshold,
                actual,
            } => write!(f, "label {label} has confidence more than {threshold} ({actual})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    Pass,
    Fail(Violation),
}

impl PolicyVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Pass => None,
            Self::Fail(v) => Some(v),
        }
    }
}

/// Minimum and maximum confidence gates applied to detected labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelPolicy {
    pub min_confidence: ThresholdMap,
    pub max_confidence: ThresholdMap,
}

impl LabelPolicy {
    pub fn new(min_confidence: ThresholdMap, max_confidence: ThresholdMap) -> Self {
        Self {
            min_confidence,
            max_confidence,
        }
    }

    /// Parse both maps from their configuration strings.
    pub fn parse(not_less_than: &str, not_more_than: &str) -> Result<Self, PolicyError> {
        Ok(Self::new(
            ThresholdMap::parse(not_less_than)?,
            ThresholdMap::parse(not_more_than)?,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.min_confidence.is_empty() && self.max_confidence.is_empty()
    }

    /// Check `labels` against every rule, returning the first violation.
    ///
    /// Labels not named by any rule are ignored, as are rules whose label
    /// was not returned.
    pub fn evaluate(&self, labels: &[Label]) -> PolicyVerdict {
        for (name, threshold) in self.min_confidence.iter() {
            if let Some(label) = labels
                .iter()
                .find(|l| l.name == name && l.confidence < threshold)
            {
                return PolicyVerdict::Fail(Violation::BelowMinimum {
                    label: name.to_string(),
                    threshold,
                    actual: label.confidence,
                });
            }
        }

        for (name, threshold) in self.max_confidence.iter() {
            if let Some(label) = labels
                .iter()
                .find(|l| l.name == name && l.confidence > threshold)
            {
                return PolicyVerdict::Fail(Violation::AboveMaximum {
                    label: name.to_string(),
                    threshold,
                    actual: label.confidence,
                });
            }
        }

        PolicyVerdict::Pass
    }
}
