//! Targeting condition operators.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::{AttributeValue, UserContext};
use crate::utils::version::compare_versions;

/// A single `attribute operator value` test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

impl Condition {
    pub fn new(
        attribute: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

/// Check one condition against a user.
///
/// Every operator except `is_set`/`is_not_set` fails when the attribute is
/// missing or an empty string. Unknown operators never match.
pub fn matches_condition(condition: &Condition, user: &UserContext) -> bool {
    let attr = user
        .get(&condition.attribute)
        .filter(|value| value.as_str() != Some(""));

    match condition.operator.as_str() {
        "is_set" => return attr.is_some(),
        "is_not_set" => return attr.is_none(),
        _ => {}
    }

    let Some(attr) = attr else {
        return false;
    };

    let raw = attr.to_string();
    let value = raw.to_lowercase();
    let expected = condition.value.to_lowercase();

    match condition.operator.as_str() {
        "equals" => value == expected,
        "not_equals" => value != expected,
        "contains" => value.contains(&expected),
        "not_contains" => !value.contains(&expected),
        "starts_with" => value.starts_with(&expected),
        "ends_with" => value.ends_with(&expected),
        "in" => split_list(&condition.value).any(|item| item.to_lowercase() == value),
        "not_in" => !split_list(&condition.value).any(|item| item.to_lowercase() == value),
        "greater_than" => compare_numeric(&attr, &condition.value, |o| o == Ordering::Greater),
        "greater_equal" => compare_numeric(&attr, &condition.value, |o| o != Ordering::Less),
        "less_than" => compare_numeric(&attr, &condition.value, |o| o == Ordering::Less),
        "less_equal" => compare_numeric(&attr, &condition.value, |o| o != Ordering::Greater),
        // Patterns match the attribute as sent, without case folding.
        "regex" => Regex::new(&condition.value)
            .map(|re| re.is_match(&raw))
            .unwrap_or(false),
        "semver_gt" => compare_versions(&raw, &condition.value) == Some(Ordering::Greater),
        "semver_lt" => compare_versions(&raw, &condition.value) == Some(Ordering::Less),
        "semver_eq" => compare_versions(&raw, &condition.value) == Some(Ordering::Equal),
        _ => false,
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim)
}

/// Unparsable numbers on either side make the comparison false.
fn compare_numeric(attr: &AttributeValue, expected: &str, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = attr.as_number() else {
        return false;
    };
    let Ok(expected) = expected.parse::<f64>() else {
        return false;
    };
    actual.partial_cmp(&expected).map(accept).unwrap_or(false)
}
