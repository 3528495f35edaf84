//! Deterministic flag evaluation.
//!
//! Evaluation order for a single flag:
//!
//! 1. A disabled flag is off.
//! 2. Users listed in `targetUsers` get `true`.
//! 3. The first enabled targeting rule whose conditions all match decides,
//!    using the rule's own rollout percentage.
//! 4. Otherwise the flag's rollout percentage applies.
//!
//! Rollout bucketing hashes `"{flag_key}:{user_id}"` with SHA-256 and takes the
//! first four bytes as a big-endian `u32`, modulo 100. Every SDK uses the same
//! layout, so a user lands in the same bucket whichever SDK evaluates the flag.

mod conditions;

pub use conditions::{matches_condition, Condition};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::types::{EvaluationDetail, EvaluationErrorKind, EvaluationReason, FlagSet, UserContext};

/// A targeting rule: conditions combined with AND, plus its own rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub rollout: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Server-side definition of a boolean flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    pub key: String,
    pub enabled: bool,
    #[serde(default)]
    pub rollout: i32,
    #[serde(default)]
    pub target_users: HashSet<String>,
    #[serde(default)]
    pub rules: Vec<TargetingRule>,
}

/// Rules snapshot as returned by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub flags: HashMap<String, FlagRule>,
}

/// Bucket a user into `0..100` for a flag.
pub fn rollout_bucket(flag_key: &str, user_id: &str) -> u32 {
    let digest = Sha256::digest(format!("{}:{}", flag_key, user_id).as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    value % 100
}

/// Whether the user falls inside `percentage` percent of the rollout.
pub fn is_in_rollout(flag_key: &str, user_id: &str, percentage: i32) -> bool {
    (rollout_bucket(flag_key, user_id) as i64) < percentage as i64
}

fn resolve_rollout(flag_key: &str, user_id: &str, rollout: i32) -> bool {
    if rollout >= 100 {
        true
    } else if rollout <= 0 {
        false
    } else {
        is_in_rollout(flag_key, user_id, rollout)
    }
}

fn matches_rule(rule: &TargetingRule, user: &UserContext) -> bool {
    !rule.conditions.is_empty() && rule.conditions.iter().all(|c| matches_condition(c, user))
}

/// Evaluate a flag for a user, returning the value and why.
pub fn evaluate(rule: &FlagRule, user: Option<&UserContext>) -> EvaluationDetail {
    if !rule.enabled {
        return EvaluationDetail::new(false, EvaluationReason::Off);
    }

    let user_id = user.map(|u| u.id.as_str()).filter(|id| !id.is_empty());

    if let Some(id) = user_id {
        if rule.target_users.contains(id) {
            return EvaluationDetail::new(true, EvaluationReason::TargetMatch);
        }
    }

    if let Some(user) = user {
        let matched = rule
            .rules
            .iter()
            .enumerate()
            .find(|(_, targeting)| targeting.enabled && matches_rule(targeting, user));

        if let Some((index, targeting)) = matched {
            let value = resolve_rollout(&rule.key, &user.id, targeting.rollout);
            return EvaluationDetail::new(
                value,
                EvaluationReason::RuleMatch {
                    rule_id: targeting.id.clone(),
                    rule_index: index,
                    in_rollout: value,
                },
            );
        }
    }

    let value = match (rule.rollout, user_id) {
        (r, _) if r >= 100 => true,
        (r, _) if r <= 0 => false,
        (r, Some(id)) => is_in_rollout(&rule.key, id, r),
        (_, None) => false,
    };
    EvaluationDetail::new(value, EvaluationReason::Fallthrough { in_rollout: value })
}

/// Evaluate a flag, returning only the value.
pub fn evaluate_flag(rule: &FlagRule, user: Option<&UserContext>) -> bool {
    evaluate(rule, user).value
}

/// Evaluate every flag in a rule map.
pub fn evaluate_all(rules: &HashMap<String, FlagRule>, user: Option<&UserContext>) -> FlagSet {
    rules
        .iter()
        .map(|(key, rule)| (key.clone(), evaluate_flag(rule, user)))
        .collect()
}

#[derive(Default)]
struct RulesSnapshot {
    version: String,
    flags: HashMap<String, FlagRule>,
}

/// Holds a rules snapshot and evaluates against it without a network round-trip.
#[derive(Default)]
pub struct LocalEvaluator {
    snapshot: RwLock<RulesSnapshot>,
}

impl LocalEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot.
    pub fn set_rules(&self, payload: RulesPayload) {
        *self.snapshot.write() = RulesSnapshot {
            version: payload.version,
            flags: payload.flags,
        };
    }

    pub fn version(&self) -> String {
        self.snapshot.read().version.clone()
    }

    pub fn has_flag(&self, flag_key: &str) -> bool {
        self.snapshot.read().flags.contains_key(flag_key)
    }

    pub fn evaluate(&self, flag_key: &str, user: Option<&UserContext>, default_value: bool) -> bool {
        self.evaluate_detail(flag_key, user, default_value).value
    }

    pub fn evaluate_detail(
        &self,
        flag_key: &str,
        user: Option<&UserContext>,
        default_value: bool,
    ) -> EvaluationDetail {
        match self.snapshot.read().flags.get(flag_key) {
            Some(rule) => evaluate(rule, user),
            None => EvaluationDetail::fallback(
                default_value,
                EvaluationReason::error(EvaluationErrorKind::FlagNotFound),
            ),
        }
    }

    pub fn evaluate_all(&self, user: Option<&UserContext>) -> FlagSet {
        evaluate_all(&self.snapshot.read().flags, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(key: &str, rollout: i32) -> FlagRule {
        FlagRule {
            key: key.to_string(),
            enabled: true,
            rollout,
            target_users: HashSet::new(),
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_rollout_golden_vectors() {
        assert_eq!(rollout_bucket("new-feature", "user-123"), 59);
        assert_eq!(rollout_bucket("dark-mode", "alice"), 88);
        assert_eq!(rollout_bucket("checkout-v2", "user-1"), 86);
        assert_eq!(rollout_bucket("beta", "bob"), 21);
        assert_eq!(rollout_bucket("flag", ""), 43);
    }

    #[test]
    fn test_rollout_boundary() {
        assert!(is_in_rollout("new-feature", "user-123", 60));
        assert!(!is_in_rollout("new-feature", "user-123", 59));
        assert!(!is_in_rollout("beta", "bob", 0));
        assert!(is_in_rollout("beta", "bob", 100));
    }

    #[test]
    fn test_fallthrough_without_user() {
        let detail = evaluate(&flag("beta", 50), None);
        assert!(!detail.value);
        assert_eq!(detail.reason, EvaluationReason::Fallthrough { in_rollout: false });

        assert!(evaluate_flag(&flag("beta", 100), None));
    }

    #[test]
    fn test_payload_parses_camel_case() {
        let payload: RulesPayload = serde_json::from_str(
            r#"{
                "version": "7",
                "flags": {
                    "beta": {
                        "key": "beta",
                        "enabled": true,
                        "rollout": 0,
                        "targetUsers": ["bob"],
                        "rules": [{
                            "id": "r1",
                            "enabled": true,
                            "rollout": 100,
                            "conditions": [{"attribute": "plan", "operator": "equals", "value": "pro"}]
                        }]
                    }
                }
            }"#,
        )
        .unwrap();

        let beta = &payload.flags["beta"];
        assert!(beta.target_users.contains("bob"));
        assert_eq!(beta.rules[0].conditions[0].operator, "equals");
    }
}
