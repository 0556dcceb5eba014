use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use derive_more::From;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Attribute value of a [`Subject`], or a clause comparison value.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    #[allow(missing_docs)]
    String(String),
    #[allow(missing_docs)]
    Number(f64),
    #[allow(missing_docs)]
    Boolean(bool),
    /// Clauses match an array attribute if any of its elements match.
    Array(Vec<AttributeValue>),
    #[allow(missing_docs)]
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl AttributeValue {
    /// Returns the string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric value if this is a number.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Interpret the value as a point in time: either epoch milliseconds or an RFC 3339 string.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => Utc.timestamp_millis_opt(*millis as i64).single(),
            AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Interpret the value as a semantic version.
    ///
    /// Missing minor and patch components are accepted and treated as zero, so `"2"` and `"2.1"`
    /// parse as `2.0.0` and `2.1.0`.
    pub fn as_semver(&self) -> Option<Version> {
        let s = self.as_str()?;
        if let Ok(version) = Version::parse(s) {
            return Some(version);
        }

        let core_end = s.find(['-', '+']).unwrap_or(s.len());
        let (core, rest) = s.split_at(core_end);
        let components = core.split('.').count();
        if components >= 3 {
            return None;
        }
        let padded = format!("{}{}{}", core, ".0".repeat(3 - components), rest);
        Version::parse(&padded).ok()
    }

    /// The string used to compute a rollout bucket. Only strings and integers are bucketable.
    pub fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                Some((*n as i64).to_string())
            }
            _ => None,
        }
    }
}

/// The entity a flag is evaluated for: a user, a device, an organization...
///
/// ```
/// # use flagsync::Subject;
/// let subject = Subject::new("subject-key")
///     .with_attribute("country", "US")
///     .with_attribute("age", 42.0);
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary: Option<String>,
    #[serde(default, rename = "custom")]
    attributes: HashMap<String, AttributeValue>,
}

impl Subject {
    /// Create a subject with the given key and no attributes.
    pub fn new(key: impl Into<String>) -> Subject {
        Subject {
            key: key.into(),
            secondary: None,
            attributes: HashMap::new(),
        }
    }

    /// Set the secondary key, which is mixed into rollout bucketing.
    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Subject {
        self.secondary = Some(secondary.into());
        self
    }

    /// Add a custom attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Subject {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[allow(missing_docs)]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[allow(missing_docs)]
    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    /// Look up an attribute by name. `key` and `secondary` resolve to the built-in fields.
    pub fn value_of(&self, attribute: &str) -> Option<AttributeValue> {
        match attribute {
            "key" => Some(AttributeValue::String(self.key.clone())),
            "secondary" => self.secondary.clone().map(AttributeValue::String),
            _ => self.attributes.get(attribute).cloned(),
        }
    }
}
