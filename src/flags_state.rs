use std::collections::HashMap;

use serde::Serialize;

use crate::{
    eval::{Detail, Reason},
    flag::{Flag, FlagValue, VariationIndex},
};

/// Options for [`Client::all_flags_state`](crate::Client::all_flags_state).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagsStateOptions {
    /// Include the evaluation reason of every flag.
    pub with_reasons: bool,
}

/// Per-flag metadata of an [`AllFlagsState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub variation: Option<VariationIndex>,
    #[allow(missing_docs)]
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[allow(missing_docs)]
    pub track_events: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub debug_events_until_date: Option<i64>,
}

/// Values of all flags for one subject.
///
/// Serializes to a JSON object with one property per flag value, plus `$flagsState` with the
/// metadata and `$valid`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllFlagsState {
    #[serde(flatten)]
    values: HashMap<String, FlagValue>,
    #[serde(rename = "$flagsState")]
    metadata: HashMap<String, FlagMetadata>,
    #[serde(rename = "$valid")]
    valid: bool,
}

impl AllFlagsState {
    pub(crate) fn new(valid: bool) -> AllFlagsState {
        AllFlagsState {
            values: HashMap::new(),
            metadata: HashMap::new(),
            valid,
        }
    }

    pub(crate) fn add(&mut self, flag: &Flag, detail: Detail<FlagValue>, with_reasons: bool) {
        let metadata = FlagMetadata {
            variation: detail.variation_index,
            version: flag.version,
            reason: with_reasons.then_some(detail.reason.clone()),
            track_events: flag.track_events || detail.reason.forces_tracking(flag),
            debug_events_until_date: flag.debug_events_until_date,
        };

        self.values
            .insert(flag.key.clone(), detail.value.unwrap_or(FlagValue::Null));
        self.metadata.insert(flag.key.clone(), metadata);
    }

    /// `false` if the state could not be computed, e.g. because the client is not initialized.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Value of a flag. `Null` if the flag has no value for the subject, `None` if there's no
    /// such flag.
    pub fn value(&self, key: &str) -> Option<&FlagValue> {
        self.values.get(key)
    }

    #[allow(missing_docs)]
    pub fn metadata(&self, key: &str) -> Option<&FlagMetadata> {
        self.metadata.get(key)
    }

    /// All flag values by key.
    pub fn values(&self) -> &HashMap<String, FlagValue> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{eval::EvalError, test_common::basic_flag};

    #[test]
    fn serializes_values_and_metadata() {
        let mut state = AllFlagsState::new(true);
        state.add(
            &basic_flag("on-flag", 3),
            Detail {
                value: Some(json!(true)),
                variation_index: Some(1),
                reason: Reason::Fallthrough,
            },
            true,
        );
        state.add(
            &basic_flag("broken", 1),
            Detail::err(EvalError::MalformedFlag),
            false,
        );

        assert!(state.valid());
        assert_eq!(state.value("on-flag"), Some(&json!(true)));
        assert_eq!(state.value("broken"), Some(&FlagValue::Null));
        assert_eq!(state.value("missing"), None);

        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "on-flag": true,
                "broken": null,
                "$flagsState": {
                    "on-flag": {"variation": 1, "version": 3, "reason": {"kind": "FALLTHROUGH"}},
                    "broken": {"version": 1}
                },
                "$valid": true
            })
        );
    }

    #[test]
    fn invalid_state_is_empty() {
        let state = AllFlagsState::new(false);
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"$flagsState": {}, "$valid": false})
        );
    }
}
