use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Flag key to boolean value, as served by the flag service.
pub type FlagSet = HashMap<String, bool>;

/// A user attribute value. The service only sends strings, numbers and booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Strings are parsed, booleans never convert.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => s.parse::<f64>().ok(),
            AttributeValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Number(value as f64)
    }
}

/// The user flags are evaluated for.
///
/// Contexts are values: `identify` swaps in a new one instead of mutating the
/// current one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttributeValue>,
}

impl UserContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn builder(id: impl Into<String>) -> UserContextBuilder {
        UserContextBuilder::new(id)
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by name. `id` and `email` address the built-in fields.
    pub fn get(&self, attribute: &str) -> Option<AttributeValue> {
        match attribute {
            "id" => Some(AttributeValue::String(self.id.clone())),
            "email" => self.email.clone().map(AttributeValue::String),
            other => self.attributes.get(other).cloned(),
        }
    }

    /// A copy carrying only the id, sent when a user is reset.
    pub fn anonymized(&self) -> UserContext {
        UserContext::new(self.id.clone())
    }
}

pub struct UserContextBuilder {
    id: String,
    email: Option<String>,
    attributes: HashMap<String, AttributeValue>,
}

impl UserContextBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            attributes: HashMap::new(),
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> UserContext {
        UserContext {
            id: self.id,
            email: self.email,
            attributes: self.attributes,
        }
    }
}

/// Why an evaluation fell back to the default value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationErrorKind {
    FlagNotFound,
    MalformedFlag,
    UserNotSpecified,
    ClientNotReady,
    #[default]
    Exception,
}

/// Why a flag evaluated to the value it did.
///
/// Serialized the way the flag service sends it:
/// `{"kind": "RULE_MATCH", "ruleId": "...", "ruleIndex": 0, "inRollout": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    Off,
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        #[serde(default)]
        rule_id: String,
        #[serde(default)]
        rule_index: usize,
        #[serde(default)]
        in_rollout: bool,
    },
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(default)]
        in_rollout: bool,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        error_kind: EvaluationErrorKind,
    },
    Unknown,
}

impl EvaluationReason {
    pub fn error(kind: EvaluationErrorKind) -> Self {
        EvaluationReason::Error { error_kind: kind }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationReason::Off => "OFF",
            EvaluationReason::TargetMatch => "TARGET_MATCH",
            EvaluationReason::RuleMatch { .. } => "RULE_MATCH",
            EvaluationReason::Fallthrough { .. } => "FALLTHROUGH",
            EvaluationReason::Error { .. } => "ERROR",
            EvaluationReason::Unknown => "UNKNOWN",
        }
    }
}

/// A boolean evaluation with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationDetail {
    pub value: bool,
    pub reason: EvaluationReason,
}

impl EvaluationDetail {
    pub fn new(value: bool, reason: EvaluationReason) -> Self {
        Self { value, reason }
    }

    /// The caller's default paired with the reason it was used.
    pub fn fallback(default_value: bool, reason: EvaluationReason) -> Self {
        Self::new(default_value, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_format() {
        let reason = EvaluationReason::RuleMatch {
            rule_id: "beta-users".to_string(),
            rule_index: 2,
            in_rollout: true,
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "RULE_MATCH",
                "ruleId": "beta-users",
                "ruleIndex": 2,
                "inRollout": true
            })
        );
    }

    #[test]
    fn test_reason_ignores_extra_fields_on_unit_kinds() {
        let reason: EvaluationReason =
            serde_json::from_str(r#"{"kind":"OFF","ruleIndex":0}"#).unwrap();
        assert_eq!(reason, EvaluationReason::Off);
    }

    #[test]
    fn test_error_reason_parses_kind() {
        let reason: EvaluationReason =
            serde_json::from_str(r#"{"kind":"ERROR","errorKind":"FLAG_NOT_FOUND"}"#).unwrap();
        assert_eq!(reason, EvaluationReason::error(EvaluationErrorKind::FlagNotFound));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed = serde_json::from_str::<EvaluationReason>(r#"{"kind":"PREREQUISITE_FAILED"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_attribute_display_matches_plain_formatting() {
        assert_eq!(AttributeValue::from(5).to_string(), "5");
        assert_eq!(AttributeValue::from(2.5).to_string(), "2.5");
        assert_eq!(AttributeValue::from(true).to_string(), "true");
    }

    #[test]
    fn test_user_get_builtin_fields() {
        let user = UserContext::new("u1").email("a@b.co").attribute("plan", "pro");
        assert_eq!(user.get("id"), Some(AttributeValue::from("u1")));
        assert_eq!(user.get("email"), Some(AttributeValue::from("a@b.co")));
        assert_eq!(user.get("plan"), Some(AttributeValue::from("pro")));
        assert_eq!(user.get("country"), None);
    }
}
