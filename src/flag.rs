use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;

use crate::{
    bucketing::{bucket_subject, Bucketer},
    eval::{Detail, EvalError, Reason},
    rules::Clause,
    Subject,
};

/// Index into a flag's list of variations.
pub type VariationIndex = usize;

/// A variation value. Flags may serve arbitrary JSON.
pub type FlagValue = serde_json::Value;

/// A feature flag definition as served by the flag delivery service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<VariationIndex>,
    #[serde(default)]
    pub variations: Vec<FlagValue>,
    /// Record full feature events for every evaluation of this flag.
    #[serde(default)]
    pub track_events: bool,
    /// Record debug events until this time (epoch milliseconds).
    #[serde(default)]
    pub debug_events_until_date: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

/// Another flag that must evaluate to `variation` before this flag is considered on.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[allow(missing_docs)]
pub struct Prerequisite {
    pub key: String,
    pub variation: VariationIndex,
}

/// Subject keys that individually receive `variation`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[allow(missing_docs)]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: VariationIndex,
}

/// A conditional rule: all clauses must match for the rule to apply.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// Either a fixed variation or a percentage rollout.
///
/// The server may send rules with neither (or both) of a variation and a rollout. Those must not
/// fail parsing of the whole flag: a fixed variation is preferred when both are present, and
/// anything else is kept as `Malformed` and reported at evaluation time.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    #[allow(missing_docs)]
    Variation { variation: VariationIndex },
    #[allow(missing_docs)]
    Rollout { rollout: Rollout },
    #[allow(missing_docs)]
    Malformed(serde_json::Value),
}

impl Default for VariationOrRollout {
    fn default() -> Self {
        VariationOrRollout::Malformed(serde_json::Value::Null)
    }
}

/// Weighted distribution of subjects across variations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Rollout {
    pub variations: Vec<WeightedVariation>,
    #[serde(default)]
    pub bucket_by: Option<String>,
}

/// A variation and its share of a rollout, in thousandths of a percent (100000 = 100%).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[allow(missing_docs)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: u32,
}

impl VariationOrRollout {
    /// Resolve to a variation index for `subject`. Returns `None` if malformed.
    pub(crate) fn variation_index(
        &self,
        flag_key: &str,
        salt: &str,
        subject: &Subject,
        bucketer: &impl Bucketer,
    ) -> Option<VariationIndex> {
        match self {
            VariationOrRollout::Variation { variation } => Some(*variation),
            VariationOrRollout::Rollout { rollout } => {
                let bucket = bucket_subject(
                    bucketer,
                    subject,
                    flag_key,
                    salt,
                    rollout.bucket_by.as_deref(),
                );
                let mut sum = 0.0;
                for weighted in &rollout.variations {
                    sum += f64::from(weighted.weight) / 100_000.0;
                    if bucket < sum {
                        return Some(weighted.variation);
                    }
                }
                // Weights that don't add up to 100000 leave a remainder. Serve the last variation.
                rollout.variations.last().map(|weighted| weighted.variation)
            }
            VariationOrRollout::Malformed(_) => None,
        }
    }
}

impl Flag {
    /// Build a detail for the variation at `index`.
    pub(crate) fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<FlagValue> {
        match self.variations.get(index) {
            Some(value) => Detail {
                value: Some(value.clone()),
                variation_index: Some(index),
                reason,
            },
            None => {
                warn!(target: "flagsync",
                      flag_key:display = self.key,
                      variation_index = index;
                      "variation index is out of range");
                Detail::err(EvalError::MalformedFlag)
            }
        }
    }

    /// Build a detail for the off variation, or an empty detail if the flag has none.
    pub(crate) fn off_value(&self, reason: Reason) -> Detail<FlagValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    /// Whether evaluations at `now` should be recorded as debug events.
    pub fn is_debugging(&self, now: DateTime<Utc>) -> bool {
        matches!(self.debug_events_until_date, Some(until) if until > now.timestamp_millis())
    }
}
