//! Flag evaluation.
use std::{collections::HashSet, sync::Arc};

use log::warn;
use serde::Serialize;

use crate::{
    bucketing::Bucketer,
    flag::{Flag, FlagValue, Prerequisite, VariationIndex, VariationOrRollout},
    store::Store,
    Subject,
};

/// The result of evaluating a flag for a subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail<T> {
    /// The served variation value, or `None` if the flag has no appropriate value (for example,
    /// the flag is off and has no off variation).
    pub value: Option<T>,

    /// Index of the served variation. `None` whenever `value` did not come from the flag.
    pub variation_index: Option<VariationIndex>,

    /// Main factor that determined the result.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// A detail without value and variation index.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// An empty detail with an error reason.
    pub fn err(error: EvalError) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// An error detail serving the caller-supplied `default`.
    pub fn err_default(error: EvalError, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    #[allow(missing_docs)]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Detail<U> {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Convert the value with `f`. If the conversion fails, serve `default` with `error` instead.
    pub fn try_map<U, F: FnOnce(T) -> Option<U>>(
        self,
        f: F,
        default: U,
        error: EvalError,
    ) -> Detail<U> {
        match self.value {
            None => Detail {
                value: Some(default),
                variation_index: self.variation_index,
                reason: self.reason,
            },
            Some(value) => match f(value) {
                Some(value) => Detail {
                    value: Some(value),
                    variation_index: self.variation_index,
                    reason: self.reason,
                },
                None => Detail::err_default(error, default),
            },
        }
    }

    /// Fill in `default` if there is no value.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }
}

/// Describes why an evaluation produced its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag is off.
    Off,
    /// The subject key is individually targeted.
    TargetMatch,
    /// The subject matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the matched rule.
        rule_index: usize,
        /// Id of the matched rule.
        #[serde(skip_serializing_if = "String::is_empty")]
        rule_id: String,
    },
    /// The flag was considered off because a prerequisite did not serve the required variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// Key of the first prerequisite that failed.
        prerequisite_key: String,
    },
    /// The flag is on but no target or rule matched.
    Fallthrough,
    /// Evaluation failed.
    #[serde(rename_all = "camelCase")]
    Error {
        #[allow(missing_docs)]
        error: EvalError,
    },
}

impl Reason {
    /// Whether full feature events must be recorded for a result with this reason.
    pub(crate) fn forces_tracking(&self, flag: &Flag) -> bool {
        match self {
            Reason::RuleMatch { rule_index, .. } => flag
                .rules
                .get(*rule_index)
                .is_some_and(|rule| rule.track_events),
            _ => false,
        }
    }
}

/// Kinds of evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalError {
    /// The store is not initialized yet.
    ClientNotReady,
    /// No flag with the given key.
    FlagNotFound,
    /// The flag refers to a variation that doesn't exist or has a malformed rule or rollout.
    MalformedFlag,
    /// The served value has a different type than the one requested.
    WrongType,
}

/// Tracks what is currently being evaluated, so that circular references between flags (through
/// prerequisites) and between segments (through `segmentMatch` clauses) terminate.
#[derive(Debug, Default)]
pub(crate) struct EvaluationStack {
    pub(crate) prerequisite_flag_chain: HashSet<String>,
    pub(crate) segment_chain: HashSet<String>,
    /// Set once a prerequisite cycle is found. Every prerequisite enclosing the cycle fails.
    pub(crate) cycle_detected: bool,
}

/// Record of a prerequisite flag evaluated on the way to the final result.
#[derive(Debug, Clone, PartialEq)]
pub struct PrerequisiteEvaluation {
    /// The prerequisite flag.
    pub flag: Arc<Flag>,
    /// Key of the flag that required it.
    pub prerequisite_of: String,
    /// Result of evaluating the prerequisite.
    pub detail: Detail<FlagValue>,
}

/// Evaluate `flag` for `subject`. Other flags and segments referenced by `flag` are looked up in
/// `store`.
pub fn evaluate(
    store: &dyn Store,
    flag: &Flag,
    subject: &Subject,
    bucketer: &impl Bucketer,
) -> Detail<FlagValue> {
    let mut stack = EvaluationStack::default();
    evaluate_internal(store, flag, subject, bucketer, &mut stack, &mut None)
}

/// Like [`evaluate`] but also returns a record for every prerequisite flag evaluated, nested
/// prerequisites first.
pub fn evaluate_with_events(
    store: &dyn Store,
    flag: &Flag,
    subject: &Subject,
    bucketer: &impl Bucketer,
) -> (Detail<FlagValue>, Vec<PrerequisiteEvaluation>) {
    let mut stack = EvaluationStack::default();
    let mut events = Some(Vec::new());
    let detail = evaluate_internal(store, flag, subject, bucketer, &mut stack, &mut events);
    (detail, events.unwrap_or_default())
}

fn evaluate_internal(
    store: &dyn Store,
    flag: &Flag,
    subject: &Subject,
    bucketer: &impl Bucketer,
    stack: &mut EvaluationStack,
    events: &mut Option<Vec<PrerequisiteEvaluation>>,
) -> Detail<FlagValue> {
    if !flag.on {
        return flag.off_value(Reason::Off);
    }

    if let Some(prerequisite_key) = failed_prerequisite(store, flag, subject, bucketer, stack, events)
    {
        return flag.off_value(Reason::PrerequisiteFailed { prerequisite_key });
    }

    if let Some(target) = flag
        .targets
        .iter()
        .find(|target| target.values.iter().any(|key| key == subject.key()))
    {
        return flag.variation(target.variation, Reason::TargetMatch);
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule.matches(subject, store, bucketer, stack) {
            let reason = Reason::RuleMatch {
                rule_index,
                rule_id: rule.id.clone(),
            };
            return serve(flag, &rule.variation_or_rollout, subject, bucketer, reason);
        }
    }

    serve(flag, &flag.fallthrough, subject, bucketer, Reason::Fallthrough)
}

fn serve(
    flag: &Flag,
    variation_or_rollout: &VariationOrRollout,
    subject: &Subject,
    bucketer: &impl Bucketer,
    reason: Reason,
) -> Detail<FlagValue> {
    match variation_or_rollout.variation_index(&flag.key, &flag.salt, subject, bucketer) {
        Some(index) => flag.variation(index, reason),
        None => {
            warn!(target: "flagsync",
                  flag_key:display = flag.key;
                  "rule or fallthrough has neither a variation nor a rollout");
            Detail::err(EvalError::MalformedFlag)
        }
    }
}

/// Evaluate prerequisites in order, returning the key of the first one that fails.
fn failed_prerequisite(
    store: &dyn Store,
    flag: &Flag,
    subject: &Subject,
    bucketer: &impl Bucketer,
    stack: &mut EvaluationStack,
    events: &mut Option<Vec<PrerequisiteEvaluation>>,
) -> Option<String> {
    if flag.prerequisites.is_empty() {
        return None;
    }

    stack.prerequisite_flag_chain.insert(flag.key.clone());

    let failed = flag.prerequisites.iter().find_map(|prerequisite| {
        let passed = prerequisite_passes(store, flag, prerequisite, subject, bucketer, stack, events);
        (!passed).then(|| prerequisite.key.clone())
    });

    stack.prerequisite_flag_chain.remove(&flag.key);
    failed
}

fn prerequisite_passes(
    store: &dyn Store,
    flag: &Flag,
    prerequisite: &Prerequisite,
    subject: &Subject,
    bucketer: &impl Bucketer,
    stack: &mut EvaluationStack,
    events: &mut Option<Vec<PrerequisiteEvaluation>>,
) -> bool {
    if stack.prerequisite_flag_chain.contains(&prerequisite.key) {
        warn!(target: "flagsync",
              flag_key:display = flag.key,
              prerequisite_key:display = prerequisite.key;
              "prerequisite relationship caused a circular reference");
        stack.cycle_detected = true;
        return false;
    }

    let Some(prerequisite_flag) = store.flag(&prerequisite.key) else {
        warn!(target: "flagsync",
              flag_key:display = flag.key,
              prerequisite_key:display = prerequisite.key;
              "missing prerequisite flag");
        return false;
    };

    let detail = evaluate_internal(store, &prerequisite_flag, subject, bucketer, stack, events);
    let passed = !stack.cycle_detected && detail.variation_index == Some(prerequisite.variation);

    if let Some(events) = events {
        events.push(PrerequisiteEvaluation {
            flag: prerequisite_flag,
            prerequisite_of: flag.key.clone(),
            detail,
        });
    }

    passed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        bucketing::Murmur3Bucketer,
        store::{DataKind, FullDataSet, ItemDescriptor},
    };

    fn flag(value: serde_json::Value) -> Flag {
        serde_json::from_value(value).unwrap()
    }

    fn store_with(flags: Vec<Flag>) -> FullDataSet {
        let mut data = FullDataSet::default();
        for flag in flags {
            data.flags
                .insert(flag.key.clone(), ItemDescriptor::from(flag));
        }
        data
    }

    fn eval(store: &FullDataSet, key: &str, subject: &Subject) -> Detail<FlagValue> {
        let flag = store.flag(key).unwrap();
        evaluate(store, &flag, subject, &Murmur3Bucketer)
    }

    #[test]
    fn flag_off_serves_off_variation() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": false,
            "offVariation": 0,
            "fallthrough": {"variation": 1},
            "variations": [false, true]
        }))]);

        let detail = eval(&store, "flag", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!(false)));
        assert_eq!(detail.variation_index, Some(0));
        assert_eq!(detail.reason, Reason::Off);
    }

    #[test]
    fn flag_off_without_off_variation_is_empty() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": false,
            "variations": [false, true]
        }))]);

        assert_eq!(
            eval(&store, "flag", &Subject::new("alice")),
            Detail::empty(Reason::Off)
        );
    }

    #[test]
    fn target_match() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": true,
            "targets": [{"values": ["alice"], "variation": 1}],
            "fallthrough": {"variation": 0},
            "variations": ["a", "b"]
        }))]);

        let detail = eval(&store, "flag", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!("b")));
        assert_eq!(detail.reason, Reason::TargetMatch);

        let detail = eval(&store, "flag", &Subject::new("bob"));
        assert_eq!(detail.value, Some(json!("a")));
        assert_eq!(detail.reason, Reason::Fallthrough);
    }

    #[test]
    fn country_rule_match_and_fallthrough() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": true,
            "rules": [{
                "id": "us-only",
                "clauses": [{"attribute": "country", "op": "in", "values": ["US"], "negate": false}],
                "variation": 1
            }],
            "fallthrough": {"variation": 0},
            "variations": [false, true]
        }))]);

        let detail = eval(
            &store,
            "flag",
            &Subject::new("a").with_attribute("country", "US"),
        );
        assert_eq!(detail.value, Some(json!(true)));
        assert_eq!(
            detail.reason,
            Reason::RuleMatch {
                rule_index: 0,
                rule_id: "us-only".to_owned()
            }
        );

        let detail = eval(
            &store,
            "flag",
            &Subject::new("b").with_attribute("country", "CA"),
        );
        assert_eq!(detail.value, Some(json!(false)));
        assert_eq!(detail.reason, Reason::Fallthrough);
    }

    #[test]
    fn fallthrough_rollout() {
        // "hashKey.saltyA.userKeyA" lands in bucket ~0.0128, "...userKeyC" in ~0.6896
        let store = store_with(vec![flag(json!({
            "key": "hashKey",
            "salt": "saltyA",
            "on": true,
            "fallthrough": {"rollout": {"variations": [
                {"variation": 0, "weight": 50000},
                {"variation": 1, "weight": 50000}
            ]}},
            "variations": ["control", "treatment"]
        }))]);

        assert_eq!(
            eval(&store, "hashKey", &Subject::new("userKeyA")).value,
            Some(json!("control"))
        );
        assert_eq!(
            eval(&store, "hashKey", &Subject::new("userKeyC")).value,
            Some(json!("treatment"))
        );
    }

    #[test]
    fn malformed_fallthrough() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": true,
            "variations": [false, true]
        }))]);

        assert_eq!(
            eval(&store, "flag", &Subject::new("alice")),
            Detail::err(EvalError::MalformedFlag)
        );
    }

    #[test]
    fn out_of_range_variation() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "on": true,
            "fallthrough": {"variation": 5},
            "variations": [false, true]
        }))]);

        assert_eq!(
            eval(&store, "flag", &Subject::new("alice")),
            Detail::err(EvalError::MalformedFlag)
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let store = store_with(vec![flag(json!({
            "key": "flag",
            "salt": "salt",
            "on": true,
            "fallthrough": {"rollout": {"variations": [
                {"variation": 0, "weight": 33333},
                {"variation": 1, "weight": 33333},
                {"variation": 2, "weight": 33334}
            ]}},
            "variations": ["a", "b", "c"]
        }))]);

        for i in 0..100 {
            let subject = Subject::new(format!("subject-{i}"));
            assert_eq!(
                eval(&store, "flag", &subject),
                eval(&store, "flag", &subject)
            );
        }
    }

    #[test]
    fn prerequisite_met() {
        let store = store_with(vec![
            flag(json!({
                "key": "parent",
                "on": true,
                "prerequisites": [{"key": "child", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true]
            })),
            flag(json!({
                "key": "child",
                "on": true,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            })),
        ]);

        let parent = store.flag("parent").unwrap();
        let (detail, events) =
            evaluate_with_events(&store, &parent, &Subject::new("alice"), &Murmur3Bucketer);
        assert_eq!(detail.value, Some(json!(true)));
        assert_eq!(detail.reason, Reason::Fallthrough);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flag.key, "child");
        assert_eq!(events[0].prerequisite_of, "parent");
        assert_eq!(events[0].detail.variation_index, Some(1));
    }

    #[test]
    fn prerequisite_wrong_variation() {
        let store = store_with(vec![
            flag(json!({
                "key": "parent",
                "on": true,
                "prerequisites": [{"key": "child", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true]
            })),
            flag(json!({
                "key": "child",
                "on": false,
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            })),
        ]);

        let detail = eval(&store, "parent", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!(false)));
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "child".to_owned()
            }
        );
    }

    #[test]
    fn off_prerequisite_serving_required_variation_passes() {
        let store = store_with(vec![
            flag(json!({
                "key": "parent",
                "on": true,
                "prerequisites": [{"key": "child", "variation": 0}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": [false, true]
            })),
            flag(json!({
                "key": "child",
                "on": false,
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            })),
        ]);

        let detail = eval(&store, "parent", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!(true)));
        assert_eq!(detail.reason, Reason::Fallthrough);
    }

    #[test]
    fn missing_prerequisite() {
        let store = store_with(vec![flag(json!({
            "key": "parent",
            "on": true,
            "prerequisites": [{"key": "missing", "variation": 0}],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": [false, true]
        }))]);

        let parent = store.flag("parent").unwrap();
        let (detail, events) =
            evaluate_with_events(&store, &parent, &Subject::new("alice"), &Murmur3Bucketer);
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "missing".to_owned()
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn prerequisite_cycle() {
        let store = store_with(vec![
            flag(json!({
                "key": "a",
                "on": true,
                "prerequisites": [{"key": "b", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": ["a-off", "a-on"]
            })),
            flag(json!({
                "key": "b",
                "on": true,
                "prerequisites": [{"key": "a", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 1,
                "variations": ["b-off", "b-on"]
            })),
        ]);

        // b serves its off variation (index 1) on failure, which would satisfy a's requirement
        // if the cycle didn't fail the whole chain.
        let detail = eval(&store, "a", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!("a-off")));
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "b".to_owned()
            }
        );
    }

    #[test]
    fn self_prerequisite() {
        let store = store_with(vec![flag(json!({
            "key": "a",
            "on": true,
            "prerequisites": [{"key": "a", "variation": 1}],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": [false, true]
        }))]);

        let detail = eval(&store, "a", &Subject::new("alice"));
        assert_eq!(detail.value, Some(json!(false)));
    }

    #[test]
    fn shared_prerequisite_is_not_a_cycle() {
        // a -> b, a -> c, b -> c: c is visited twice but never while on the chain.
        let store = store_with(vec![
            flag(json!({
                "key": "a",
                "on": true,
                "prerequisites": [{"key": "b", "variation": 0}, {"key": "c", "variation": 0}],
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            })),
            flag(json!({
                "key": "b",
                "on": true,
                "prerequisites": [{"key": "c", "variation": 0}],
                "fallthrough": {"variation": 0},
                "variations": [true, false]
            })),
            flag(json!({
                "key": "c",
                "on": true,
                "fallthrough": {"variation": 0},
                "variations": [true, false]
            })),
        ]);

        let detail = eval(&store, "a", &Subject::new("alice"));
        assert_eq!(detail.reason, Reason::Fallthrough);
        assert_eq!(detail.value, Some(json!(true)));
    }

    #[test]
    fn segment_match_rule() {
        let mut store = store_with(vec![flag(json!({
            "key": "flag",
            "on": true,
            "rules": [{
                "id": "beta",
                "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["beta-users"], "negate": false}],
                "variation": 1
            }],
            "fallthrough": {"variation": 0},
            "variations": [false, true]
        }))]);
        let segment: crate::segment::Segment =
            serde_json::from_value(json!({"key": "beta-users", "version": 1, "included": ["alice"]}))
                .unwrap();
        store
            .segments
            .insert(segment.key.clone(), ItemDescriptor::from(segment));
        assert!(store.items(DataKind::Segments).contains_key("beta-users"));

        assert_eq!(
            eval(&store, "flag", &Subject::new("alice")).value,
            Some(json!(true))
        );
        assert_eq!(
            eval(&store, "flag", &Subject::new("bob")).value,
            Some(json!(false))
        );
    }

    #[test]
    fn detail_or_and_try_map() {
        let empty: Detail<FlagValue> = Detail::empty(Reason::Off);
        let detail = empty.or(json!(7));
        assert_eq!(detail.value, Some(json!(7)));
        assert_eq!(detail.variation_index, None);

        let served = Detail {
            value: Some(json!("text")),
            variation_index: Some(0),
            reason: Reason::Fallthrough,
        };
        let typed = served.try_map(|value| value.as_bool(), false, EvalError::WrongType);
        assert_eq!(typed, Detail::err_default(EvalError::WrongType, false));
    }

    #[test]
    fn reason_serialization() {
        assert_eq!(
            serde_json::to_value(Reason::RuleMatch {
                rule_index: 2,
                rule_id: "r".to_owned()
            })
            .unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 2, "ruleId": "r"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Error {
                error: EvalError::FlagNotFound
            })
            .unwrap(),
            json!({"kind": "ERROR", "error": "FLAG_NOT_FOUND"})
        );
    }
}
