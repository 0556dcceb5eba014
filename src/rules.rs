use log::warn;
use regex::Regex;
use serde::Deserialize;

use crate::{
    bucketing::Bucketer, eval::EvaluationStack, flag::FlagRule, store::Store, AttributeValue,
    Subject,
};

/// A single condition of a rule.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<AttributeValue>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause comparison operator.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum Operator {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    /// An operator this library doesn't know about. Never matches.
    #[serde(other)]
    Unknown,
}

impl FlagRule {
    pub(crate) fn matches(
        &self,
        subject: &Subject,
        store: &dyn Store,
        bucketer: &impl Bucketer,
        stack: &mut EvaluationStack,
    ) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.matches(subject, store, bucketer, stack))
    }
}

impl Clause {
    pub(crate) fn matches(
        &self,
        subject: &Subject,
        store: &dyn Store,
        bucketer: &impl Bucketer,
        stack: &mut EvaluationStack,
    ) -> bool {
        if self.op == Operator::SegmentMatch {
            let any_match = self.values.iter().any(|value| {
                value
                    .as_str()
                    .and_then(|segment_key| store.segment(segment_key))
                    .is_some_and(|segment| segment.contains(subject, store, bucketer, stack))
            });
            return self.maybe_negate(any_match);
        }

        self.matches_attribute(subject)
    }

    /// Match against the subject's attribute value. A missing attribute never matches, even if
    /// the clause is negated.
    fn matches_attribute(&self, subject: &Subject) -> bool {
        let any_match = match subject.value_of(&self.attribute) {
            None | Some(AttributeValue::Null) => return false,
            Some(AttributeValue::Array(values)) => {
                values.iter().any(|value| self.matches_any_value(value))
            }
            Some(value) => self.matches_any_value(&value),
        };
        self.maybe_negate(any_match)
    }

    fn matches_any_value(&self, attribute: &AttributeValue) -> bool {
        self.values
            .iter()
            .any(|clause_value| self.op.eval(attribute, clause_value))
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    fn eval(&self, attribute: &AttributeValue, clause_value: &AttributeValue) -> bool {
        self.try_eval(attribute, clause_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, attribute: &AttributeValue, clause_value: &AttributeValue) -> Option<bool> {
        match self {
            Self::In => Some(attribute == clause_value),

            Self::StartsWith => Some(attribute.as_str()?.starts_with(clause_value.as_str()?)),
            Self::EndsWith => Some(attribute.as_str()?.ends_with(clause_value.as_str()?)),
            Self::Contains => Some(attribute.as_str()?.contains(clause_value.as_str()?)),
            Self::Matches => {
                let s = attribute.as_str()?;
                let regex = match Regex::new(clause_value.as_str()?) {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!(target: "flagsync", "invalid regex for 'matches' operator: {}", err);
                        return None;
                    }
                };
                Some(regex.is_match(s))
            }

            Self::LessThan | Self::LessThanOrEqual | Self::GreaterThan | Self::GreaterThanOrEqual => {
                let attribute = attribute.to_f64()?;
                let clause_value = clause_value.to_f64()?;
                Some(match self {
                    Self::LessThan => attribute < clause_value,
                    Self::LessThanOrEqual => attribute <= clause_value,
                    Self::GreaterThan => attribute > clause_value,
                    Self::GreaterThanOrEqual => attribute >= clause_value,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::Before | Self::After => {
                let attribute = attribute.to_datetime()?;
                let clause_value = clause_value.to_datetime()?;
                Some(if *self == Self::Before {
                    attribute < clause_value
                } else {
                    attribute > clause_value
                })
            }

            Self::SemVerEqual | Self::SemVerLessThan | Self::SemVerGreaterThan => {
                let attribute = attribute.as_semver()?;
                let clause_value = clause_value.as_semver()?;
                Some(match self {
                    Self::SemVerEqual => attribute == clause_value,
                    Self::SemVerLessThan => attribute < clause_value,
                    Self::SemVerGreaterThan => attribute > clause_value,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            // Segment membership needs the store and is handled by `Clause::matches`.
            Self::SegmentMatch | Self::Unknown => None,
        }
    }
}
