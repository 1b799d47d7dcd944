use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::target::TargetSpec;

/// Unique identifier correlating one call attempt to its reply.
///
/// Every attempt carries its own token; the tokens of earlier attempts of a
/// retried call travel in the request's `tries` list, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub String);

impl Token {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Fan-out selector for structured targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// Exactly one eligible recipient.
    #[default]
    Any,
    /// Every eligible recipient.
    All,
}

/// Account/shard routing scope of a structured target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<i64>,
}

/// One-way call envelope. No reply is expected; `confirm` marks that the
/// sending side registered a handler for an optional acknowledgment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Push {
    pub route: String,
    pub payload: Value,
    pub from: String,
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<TargetScope>,
    #[serde(default)]
    pub selector: Selector,
    pub persistent: bool,
    /// Epoch seconds after which the call is stale; 0 means never.
    pub expires_at: u64,
    #[serde(default)]
    pub confirm: bool,
}

impl Push {
    pub fn new(route: impl Into<String>, payload: Value, from: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            payload,
            from: from.into(),
            token: Token::generate(),
            target: None,
            tags: Vec::new(),
            scope: None,
            selector: Selector::Any,
            persistent: false,
            expires_at: 0,
            confirm: false,
        }
    }
}

/// Two-way call envelope expecting exactly one correlated reply.
///
/// A present `reply_to` marks a legacy respondent that expects its reply on a
/// direct queue and cannot interpret non-delivery results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub route: String,
    pub payload: Value,
    pub from: String,
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<TargetScope>,
    #[serde(default)]
    pub selector: Selector,
    pub persistent: bool,
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Tokens of earlier attempts of this logical call, oldest first.
    #[serde(default)]
    pub tries: Vec<Token>,
    #[serde(default)]
    pub confirm: bool,
}

impl Request {
    pub fn new(route: impl Into<String>, payload: Value, from: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            payload,
            from: from.into(),
            token: Token::generate(),
            target: None,
            tags: Vec::new(),
            scope: None,
            selector: Selector::Any,
            persistent: false,
            expires_at: 0,
            reply_to: None,
            tries: Vec::new(),
            confirm: false,
        }
    }
}

/// A call envelope in flight: one-way push or two-way request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CallEnvelope {
    Push(Push),
    Request(Request),
}

impl CallEnvelope {
    pub fn route(&self) -> &str {
        match self {
            Self::Push(push) => &push.route,
            Self::Request(request) => &request.route,
        }
    }

    pub fn token(&self) -> &Token {
        match self {
            Self::Push(push) => &push.token,
            Self::Request(request) => &request.token,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Push(push) => &push.payload,
            Self::Request(request) => &request.payload,
        }
    }

    pub fn from(&self) -> &str {
        match self {
            Self::Push(push) => &push.from,
            Self::Request(request) => &request.from,
        }
    }

    pub fn expires_at(&self) -> u64 {
        match self {
            Self::Push(push) => push.expires_at,
            Self::Request(request) => request.expires_at,
        }
    }

    pub fn persistent(&self) -> bool {
        match self {
            Self::Push(push) => push.persistent,
            Self::Request(request) => request.persistent,
        }
    }

    /// Tokens of earlier attempts; always empty for a push.
    pub fn tries(&self) -> &[Token] {
        match self {
            Self::Push(_) => &[],
            Self::Request(request) => &request.tries,
        }
    }

    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Self::Push(_) => None,
            Self::Request(request) => request.reply_to.as_deref(),
        }
    }

    pub fn is_one_way(&self) -> bool {
        matches!(self, Self::Push(_))
    }

    /// Copy validated addressing fields onto the envelope.
    pub fn set_addressing(&mut self, spec: &TargetSpec) {
        match self {
            Self::Push(push) => {
                push.target = spec.named.clone();
                push.tags = spec.tags.clone();
                push.scope = spec.scope.clone();
                push.selector = spec.selector;
            }
            Self::Request(request) => {
                request.target = spec.named.clone();
                request.tags = spec.tags.clone();
                request.scope = spec.scope.clone();
                request.selector = spec.selector;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tokens_are_unique() {
        assert_ne!(Token::generate(), Token::generate());
    }

    #[test]
    fn push_defaults() {
        let push = Push::new("/welcome/aboard", json!("iZac"), "agent");
        assert_eq!(push.route, "/welcome/aboard");
        assert_eq!(push.from, "agent");
        assert!(!push.persistent);
        assert!(!push.confirm);
        assert_eq!(push.expires_at, 0);
        assert_eq!(push.selector, Selector::Any);
        assert!(push.target.is_none());
    }

    #[test]
    fn request_defaults() {
        let request = Request::new("/welcome/aboard", json!("iZac"), "agent");
        assert!(request.reply_to.is_none());
        assert!(request.tries.is_empty());
        assert!(!request.confirm);
    }

    #[test]
    fn envelope_accessors() {
        let request = Request::new("/foo/bar", json!(1), "agent");
        let token = request.token.clone();
        let envelope = CallEnvelope::Request(request);
        assert_eq!(envelope.route(), "/foo/bar");
        assert_eq!(envelope.token(), &token);
        assert!(!envelope.is_one_way());
        assert!(envelope.tries().is_empty());

        let push = CallEnvelope::Push(Push::new("/foo/bar", json!(1), "agent"));
        assert!(push.is_one_way());
        assert!(push.reply_to().is_none());
    }

    #[test]
    fn envelope_survives_serde() {
        let mut request = Request::new("/foo/bar", json!({"k": 1}), "agent");
        request.tries.push(Token::from("earlier"));
        let encoded = serde_json::to_string(&CallEnvelope::Request(request)).unwrap();
        let decoded: CallEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.route(), "/foo/bar");
        assert_eq!(decoded.tries(), &[Token::from("earlier")]);
    }
}
