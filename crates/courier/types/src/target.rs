use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Selector, TargetScope};

/// Rejection reasons for malformed outbound addressing.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Invalid target hash")]
    InvalidHash,

    #[error("Invalid target selector")]
    InvalidSelector,

    #[error("Invalid target tags")]
    InvalidTags,

    #[error("Invalid target scope")]
    InvalidScope,

    #[error("Invalid target")]
    Invalid,
}

/// Validate the addressing shape of an outbound call.
///
/// `None` (any recipient) and a plain name are always valid. A structured
/// target may carry `tags`, `scope`, and, for one-way fan-out calls only
/// (`allow_selector`), a `selector` of `all` or `any`. A two-way call must
/// resolve to exactly one respondent, so selectors are rejected there even
/// inside an otherwise valid structure.
pub fn validate_target(target: Option<&Value>, allow_selector: bool) -> Result<(), TargetError> {
    let value = match target {
        None => return Ok(()),
        Some(value) => value,
    };
    match value {
        Value::String(_) => Ok(()),
        Value::Object(map) => {
            if map.is_empty() {
                return Err(TargetError::InvalidHash);
            }
            for key in map.keys() {
                match key.as_str() {
                    "selector" if allow_selector => {}
                    "tags" | "scope" => {}
                    _ => return Err(TargetError::InvalidHash),
                }
            }
            if let Some(selector) = map.get("selector") {
                match selector.as_str() {
                    Some("all") | Some("any") => {}
                    _ => return Err(TargetError::InvalidSelector),
                }
            }
            if let Some(tags) = map.get("tags") {
                if !tags.is_array() {
                    return Err(TargetError::InvalidTags);
                }
            }
            if let Some(scope) = map.get("scope") {
                let scope = scope.as_object().ok_or(TargetError::InvalidScope)?;
                if scope.is_empty() {
                    return Err(TargetError::InvalidScope);
                }
                for key in scope.keys() {
                    if key != "account" && key != "shard" {
                        return Err(TargetError::InvalidScope);
                    }
                }
            }
            Ok(())
        }
        _ => Err(TargetError::Invalid),
    }
}

/// Validated addressing fields extracted from a raw target value, ready to
/// copy onto an envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetSpec {
    pub named: Option<String>,
    pub tags: Vec<String>,
    pub scope: Option<TargetScope>,
    pub selector: Selector,
}

impl TargetSpec {
    pub fn from_value(target: Option<&Value>, allow_selector: bool) -> Result<Self, TargetError> {
        validate_target(target, allow_selector)?;
        let mut spec = Self::default();
        match target {
            Some(Value::String(name)) => spec.named = Some(name.clone()),
            Some(Value::Object(map)) => {
                if let Some(tags) = map.get("tags").and_then(Value::as_array) {
                    spec.tags = tags
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect();
                }
                if let Some(scope) = map.get("scope").and_then(Value::as_object) {
                    spec.scope = Some(TargetScope {
                        account: scope.get("account").and_then(Value::as_i64),
                        shard: scope.get("shard").and_then(Value::as_i64),
                    });
                }
                if map.get("selector").and_then(Value::as_str) == Some("all") {
                    spec.selector = Selector::All;
                }
            }
            _ => {}
        }
        Ok(spec)
    }
}
