use chrono::Utc;
use serde::Serialize;

use crate::{
    eval::{Detail, PrerequisiteEvaluation, Reason},
    flag::{Flag, FlagValue, VariationIndex},
    Subject,
};

/// A record of one flag evaluation, handed to the [`EventRecorder`].
///
/// One event is produced for every `variation` call, plus one for each prerequisite flag
/// evaluated on the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequestEvent {
    /// Evaluation time, epoch milliseconds.
    pub creation_date: i64,
    /// Flag key.
    pub key: String,
    #[allow(missing_docs)]
    pub subject: Subject,
    /// Flag version, `None` if the flag was not found.
    pub version: Option<u64>,
    /// Index of the served variation.
    pub variation: Option<VariationIndex>,
    /// Served value, which is the default value if evaluation failed.
    pub value: FlagValue,
    /// Default value supplied by the caller. `None` for prerequisite evaluations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<FlagValue>,
    #[allow(missing_docs)]
    pub reason: Reason,
    /// For prerequisite evaluations, the key of the flag that required this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
    /// Whether a full event must be kept for this evaluation rather than only a summary.
    pub track_events: bool,
    #[allow(missing_docs)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<i64>,
}

impl FeatureRequestEvent {
    /// Event for a flag evaluated by a `variation` call.
    pub(crate) fn new_evaluation(
        flag: &Flag,
        subject: &Subject,
        detail: &Detail<FlagValue>,
        default: FlagValue,
    ) -> FeatureRequestEvent {
        FeatureRequestEvent {
            creation_date: Utc::now().timestamp_millis(),
            key: flag.key.clone(),
            subject: subject.clone(),
            version: Some(flag.version),
            variation: detail.variation_index,
            value: detail.value.clone().unwrap_or_else(|| default.clone()),
            default: Some(default),
            reason: detail.reason.clone(),
            prereq_of: None,
            track_events: flag.track_events || detail.reason.forces_tracking(flag),
            debug_events_until_date: flag.debug_events_until_date,
        }
    }

    /// Event for a `variation` call that didn't find the flag.
    pub(crate) fn new_unknown_flag(
        key: &str,
        subject: &Subject,
        default: FlagValue,
        reason: Reason,
    ) -> FeatureRequestEvent {
        FeatureRequestEvent {
            creation_date: Utc::now().timestamp_millis(),
            key: key.to_owned(),
            subject: subject.clone(),
            version: None,
            variation: None,
            value: default.clone(),
            default: Some(default),
            reason,
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
        }
    }

    /// Event for a prerequisite flag evaluated on the way to another flag's result.
    pub(crate) fn new_prerequisite(
        evaluation: PrerequisiteEvaluation,
        subject: &Subject,
    ) -> FeatureRequestEvent {
        let PrerequisiteEvaluation {
            flag,
            prerequisite_of,
            detail,
        } = evaluation;

        FeatureRequestEvent {
            creation_date: Utc::now().timestamp_millis(),
            key: flag.key.clone(),
            subject: subject.clone(),
            version: Some(flag.version),
            variation: detail.variation_index,
            value: detail.value.unwrap_or(FlagValue::Null),
            default: None,
            track_events: flag.track_events || detail.reason.forces_tracking(&flag),
            reason: detail.reason,
            prereq_of: Some(prerequisite_of),
            debug_events_until_date: flag.debug_events_until_date,
        }
    }
}

/// Receives a [`FeatureRequestEvent`] for every evaluation.
///
/// Implementations typically forward events to an analytics pipeline. Recording is called
/// synchronously on the evaluating thread, so it should not block.
///
/// Any `Fn(FeatureRequestEvent)` closure is an event recorder.
pub trait EventRecorder {
    /// Record a single evaluation.
    fn record_feature_request(&self, event: FeatureRequestEvent);
}

pub(crate) struct NoopEventRecorder;
impl EventRecorder for NoopEventRecorder {
    fn record_feature_request(&self, _event: FeatureRequestEvent) {}
}

impl<T: Fn(FeatureRequestEvent)> EventRecorder for T {
    fn record_feature_request(&self, event: FeatureRequestEvent) {
        self(event);
    }
}
