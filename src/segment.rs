use log::warn;
use serde::Deserialize;

use crate::{
    bucketing::{bucket_subject, Bucketer},
    eval::EvaluationStack,
    rules::Clause,
    store::Store,
    Subject,
};

/// A named set of subjects, referenced from clauses with the `segmentMatch` operator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub deleted: bool,
}

/// A segment rule. Subjects matching all clauses are members, optionally limited to a
/// percentage of them by `weight`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct SegmentRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub bucket_by: Option<String>,
}

impl Segment {
    /// Whether `subject` is a member of this segment.
    ///
    /// Explicit inclusion wins over exclusion, and exclusion wins over rules.
    pub(crate) fn contains(
        &self,
        subject: &Subject,
        store: &dyn Store,
        bucketer: &impl Bucketer,
        stack: &mut EvaluationStack,
    ) -> bool {
        if self.included.iter().any(|key| key == subject.key()) {
            return true;
        }
        if self.excluded.iter().any(|key| key == subject.key()) {
            return false;
        }

        if !stack.segment_chain.insert(self.key.clone()) {
            warn!(target: "flagsync",
                  segment_key:display = self.key;
                  "segment rule referencing segment caused a circular reference");
            return false;
        }

        let matched = self
            .rules
            .iter()
            .any(|rule| rule.matches(self, subject, store, bucketer, stack));

        stack.segment_chain.remove(&self.key);
        matched
    }
}

impl SegmentRule {
    fn matches(
        &self,
        segment: &Segment,
        subject: &Subject,
        store: &dyn Store,
        bucketer: &impl Bucketer,
        stack: &mut EvaluationStack,
    ) -> bool {
        if !self
            .clauses
            .iter()
            .all(|clause| clause.matches(subject, store, bucketer, stack))
        {
            return false;
        }

        match self.weight {
            None => true,
            Some(weight) => {
                let bucket = bucket_subject(
                    bucketer,
                    subject,
                    &segment.key,
                    &segment.salt,
                    self.bucket_by.as_deref(),
                );
                bucket < f64::from(weight) / 100_000.0
            }
        }
    }
}
