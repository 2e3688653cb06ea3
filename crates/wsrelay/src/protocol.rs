//! Wire protocol: envelopes, server frames and message validation.
//!
//! Client → server (JSON text frames):
//!
//! ```text
//! {"type":"subscribe"|"unsubscribe","topic":"<string>"}
//! {"type":"publish","topic":"<string>","payload":<any>}
//! ```
//!
//! Server → client: `{"topic":"<string>","payload":<any>}`.
//!
//! Validation comes in two flavours. [`validate_message`] fails hard and is
//! meant for call sites that treat a bad message as a protocol violation.
//! [`safe_validate_message`] fails soft and returns the issues instead, which
//! is what the relay uses for input from untrusted peers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::CodecError;

// ==================== Envelopes ====================

/// A validated client message. `payload` exists only on `Publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: Value },
}

impl Envelope {
    pub fn topic(&self) -> &str {
        match self {
            Envelope::Subscribe { topic }
            | Envelope::Unsubscribe { topic }
            | Envelope::Publish { topic, .. } => topic,
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Unsubscribe { .. } => "unsubscribe",
            Envelope::Publish { .. } => "publish",
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Envelope::Subscribe { topic } | Envelope::Unsubscribe { topic } => {
                json!({ "type": self.kind(), "topic": topic }).to_string()
            }
            Envelope::Publish { topic, payload } => {
                json!({ "type": "publish", "topic": topic, "payload": payload }).to_string()
            }
        }
    }
}

/// A server → peer frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub topic: String,
    pub payload: Value,
}

impl ServerFrame {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn encode(&self) -> String {
        json!({ "topic": self.topic, "payload": self.payload }).to_string()
    }
}

// ==================== Lenient Parsing ====================

/// Result of [`parse_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Json(Value),
    /// The input was not JSON; the original text is returned untouched.
    Text(String),
}

/// Parse socket text as JSON, falling back to the raw text.
pub fn parse_message(raw: &str) -> ParsedMessage {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => ParsedMessage::Json(value),
        Err(_) => ParsedMessage::Text(raw.to_string()),
    }
}

// ==================== Issues ====================

/// One validation problem. `path` is a dotted field path, `None` for the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub path: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn root(message: impl Into<String>) -> Self {
        Self {
            path: None,
            message: message.into(),
        }
    }

    pub fn at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            message: message.into(),
        }
    }

    /// Re-root this issue under `parent`.
    pub fn nested(self, parent: &str) -> Self {
        let path = match self.path {
            Some(p) => format!("{}.{}", parent, p),
            None => parent.to_string(),
        };
        Self {
            path: Some(path),
            message: self.message,
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ==================== Schemas ====================

/// A validator from an already-parsed JSON value to a typed output.
pub trait Schema {
    type Output;

    fn validate(&self, value: &Value) -> Result<Self::Output, Vec<Issue>>;
}

/// Extra checks applied to a publish payload.
pub trait PayloadValidator: Send + Sync {
    /// Returns the issues found; empty means valid.
    fn check(&self, payload: &Value) -> Vec<Issue>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Vec<Issue> + Send + Sync,
{
    fn check(&self, payload: &Value) -> Vec<Issue> {
        self(payload)
    }
}

/// Schema for any serde-deserializable type.
///
/// Usable on its own or as the payload validator of an [`EnvelopeSchema`].
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Schema for TypedSchema<T> {
    type Output = T;

    fn validate(&self, value: &Value) -> Result<T, Vec<Issue>> {
        T::deserialize(value).map_err(|e| vec![Issue::root(e.to_string())])
    }
}

impl<T: DeserializeOwned> PayloadValidator for TypedSchema<T> {
    fn check(&self, payload: &Value) -> Vec<Issue> {
        match T::deserialize(payload) {
            Ok(_) => Vec::new(),
            Err(e) => vec![Issue::root(e.to_string())],
        }
    }
}

/// Deployment-specific constraints on topic names.
///
/// Checks run in the order trim → non-empty → prefix, so a topic of
/// whitespace only fails `non_empty` once trimmed.
#[derive(Debug, Clone, Default)]
pub struct TopicShape {
    trim: bool,
    non_empty: bool,
    prefix: Option<String>,
}

impl TopicShape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip surrounding whitespace before the other checks and in the output.
    pub fn trimmed(mut self) -> Self {
        self.trim = true;
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }

    pub fn starts_with(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Validate a topic string, returning its normalized form.
    pub fn check(&self, topic: &str) -> Result<String, Vec<Issue>> {
        let topic = if self.trim { topic.trim() } else { topic };
        let mut issues = Vec::new();

        if self.non_empty && topic.is_empty() {
            issues.push(Issue::root("must not be empty"));
        }
        if let Some(prefix) = &self.prefix
            && !topic.starts_with(prefix.as_str())
        {
            issues.push(Issue::root(format!("must start with {:?}", prefix)));
        }

        if issues.is_empty() {
            Ok(topic.to_string())
        } else {
            Err(issues)
        }
    }
}

impl Schema for TopicShape {
    type Output = String;

    fn validate(&self, value: &Value) -> Result<String, Vec<Issue>> {
        match value.as_str() {
            Some(topic) => self.check(topic),
            None => Err(vec![Issue::root("expected a string")]),
        }
    }
}

/// The tagged union of subscribe, unsubscribe and publish messages.
#[derive(Clone, Default)]
pub struct EnvelopeSchema {
    topic: Option<TopicShape>,
    payload: Option<Arc<dyn PayloadValidator>>,
}

impl EnvelopeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain the `topic` field of every message kind.
    pub fn topic(mut self, shape: TopicShape) -> Self {
        self.topic = Some(shape);
        self
    }

    /// Constrain the `payload` field of publish messages.
    pub fn payload(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.payload = Some(Arc::new(validator));
        self
    }

    fn validate_topic(&self, value: Option<&Value>, issues: &mut Vec<Issue>) -> Option<String> {
        let raw = match value {
            Some(Value::String(raw)) => raw,
            Some(_) => {
                issues.push(Issue::at("topic", "expected a string"));
                return None;
            }
            None => {
                issues.push(Issue::at("topic", "missing"));
                return None;
            }
        };

        match &self.topic {
            Some(shape) => match shape.check(raw) {
                Ok(topic) => Some(topic),
                Err(found) => {
                    issues.extend(found.into_iter().map(|i| i.nested("topic")));
                    None
                }
            },
            None => Some(raw.clone()),
        }
    }
}

impl fmt::Debug for EnvelopeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeSchema")
            .field("topic", &self.topic)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl Schema for EnvelopeSchema {
    type Output = Envelope;

    fn validate(&self, value: &Value) -> Result<Envelope, Vec<Issue>> {
        let Some(object) = value.as_object() else {
            return Err(vec![Issue::root("expected an object")]);
        };

        let mut issues = Vec::new();

        let kind = match object.get("type") {
            Some(Value::String(kind))
                if matches!(kind.as_str(), "subscribe" | "unsubscribe" | "publish") =>
            {
                Some(kind.as_str())
            }
            Some(Value::String(kind)) => {
                issues.push(Issue::at(
                    "type",
                    format!(
                        "expected \"subscribe\", \"unsubscribe\" or \"publish\", got {:?}",
                        kind
                    ),
                ));
                None
            }
            Some(_) => {
                issues.push(Issue::at("type", "expected a string"));
                None
            }
            None => {
                issues.push(Issue::at("type", "missing"));
                None
            }
        };

        let topic = self.validate_topic(object.get("topic"), &mut issues);

        let payload = if kind == Some("publish") {
            match object.get("payload") {
                Some(payload) => {
                    if let Some(validator) = &self.payload {
                        issues.extend(
                            validator
                                .check(payload)
                                .into_iter()
                                .map(|i| i.nested("payload")),
                        );
                    }
                    Some(payload.clone())
                }
                None => {
                    issues.push(Issue::at("payload", "missing"));
                    None
                }
            }
        } else {
            None
        };

        if !issues.is_empty() {
            return Err(issues);
        }

        match (kind, topic, payload) {
            (Some("subscribe"), Some(topic), _) => Ok(Envelope::Subscribe { topic }),
            (Some("unsubscribe"), Some(topic), _) => Ok(Envelope::Unsubscribe { topic }),
            (Some("publish"), Some(topic), Some(payload)) => {
                Ok(Envelope::Publish { topic, payload })
            }
            _ => Err(vec![Issue::root("unrecognized message")]),
        }
    }
}

// ==================== Validation Entry Points ====================

/// Outcome of a fail-soft validation. `Invalid` always carries at least one issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid(Vec<Issue>),
}

impl<T> Validation<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Validation::Valid(value) => Some(value),
            Validation::Invalid(_) => None,
        }
    }

    pub fn issues(&self) -> Option<&[Issue]> {
        match self {
            Validation::Valid(_) => None,
            Validation::Invalid(issues) => Some(issues),
        }
    }

    pub fn into_result(self) -> Result<T, Vec<Issue>> {
        match self {
            Validation::Valid(value) => Ok(value),
            Validation::Invalid(issues) => Err(issues),
        }
    }
}

/// Decode a raw message against the default envelope schema.
pub fn decode(raw: &str) -> Result<Envelope, CodecError> {
    validate_message(&EnvelopeSchema::default(), raw)
}

/// Fail-hard validation of raw socket text.
pub fn validate_message<S: Schema>(schema: &S, raw: &str) -> Result<S::Output, CodecError> {
    let value: Value = serde_json::from_str(raw)?;
    validate_value(schema, &value)
}

/// Fail-hard validation of an already-parsed value.
///
/// A schema that rejects without saying why is reported as a single
/// root-level issue, so `Invalid` is never empty.
pub fn validate_value<S: Schema>(schema: &S, value: &Value) -> Result<S::Output, CodecError> {
    schema.validate(value).map_err(|issues| {
        if issues.is_empty() {
            CodecError::Invalid(vec![Issue::root("rejected by schema")])
        } else {
            CodecError::Invalid(issues)
        }
    })
}

/// Fail-soft validation of raw socket text. Never panics, never errors.
pub fn safe_validate_message<S: Schema>(schema: &S, raw: &str) -> Validation<S::Output> {
    match validate_message(schema, raw) {
        Ok(value) => Validation::Valid(value),
        Err(e) => Validation::Invalid(e.into_issues()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Cursor {
        x: f64,
        y: f64,
    }

    fn page_schema() -> EnvelopeSchema {
        EnvelopeSchema::new()
            .topic(TopicShape::new().trimmed().non_empty().starts_with("page:"))
            .payload(TypedSchema::<Cursor>::new())
    }

    #[test]
    fn test_decode_subscribe() {
        let env = decode(r#"{"type":"subscribe","topic":"page:1"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::Subscribe {
                topic: "page:1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_publish_keeps_payload() {
        let env = decode(r#"{"type":"publish","topic":"t","payload":{"x":1,"y":2}}"#).unwrap();
        match env {
            Envelope::Publish { topic, payload } => {
                assert_eq!(topic, "t");
                assert_eq!(payload, json!({"x": 1, "y": 2}));
            }
            other => panic!("Expected publish, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_payload_is_invalid() {
        let err = decode(r#"{"type":"publish","topic":"t"}"#).unwrap_err();
        match err {
            CodecError::Invalid(issues) => {
                assert_eq!(issues, vec![Issue::at("payload", "missing")]);
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_ignores_extra_fields() {
        let env = decode(r#"{"type":"subscribe","topic":"t","payload":1}"#).unwrap();
        assert_eq!(env, Envelope::Subscribe { topic: "t".into() });
    }

    #[test]
    fn test_unknown_type_and_missing_topic_report_all_issues() {
        let err = decode(r#"{"type":"shout"}"#).unwrap_err();
        let issues = err.into_issues();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].path.as_deref(), Some("type"));
        assert_eq!(issues[1], Issue::at("topic", "missing"));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(decode("{not json"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_non_object_is_invalid() {
        let issues = decode("[1,2]").unwrap_err().into_issues();
        assert_eq!(issues, vec![Issue::root("expected an object")]);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let envelopes = [
            Envelope::Subscribe { topic: "a".into() },
            Envelope::Unsubscribe { topic: "b".into() },
            Envelope::Publish {
                topic: "c".into(),
                payload: json!({"nested": [1, "two", null]}),
            },
        ];
        for env in envelopes {
            assert_eq!(decode(&env.encode()).unwrap(), env);
        }
    }

    #[test]
    fn test_topic_shape_trims_and_checks_prefix() {
        let schema = page_schema();
        let env = validate_message(&schema, r#"{"type":"subscribe","topic":"  page:7 "}"#).unwrap();
        assert_eq!(env.topic(), "page:7");

        let issues = validate_message(&schema, r#"{"type":"subscribe","topic":"chat"}"#)
            .unwrap_err()
            .into_issues();
        assert_eq!(issues, vec![Issue::at("topic", "must start with \"page:\"")]);
    }

    #[test]
    fn test_blank_topic_fails_non_empty_and_prefix() {
        let issues = validate_message(&page_schema(), r#"{"type":"unsubscribe","topic":"   "}"#)
            .unwrap_err()
            .into_issues();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0], Issue::at("topic", "must not be empty"));
    }

    #[test]
    fn test_typed_payload_validation() {
        let schema = page_schema();
        let ok = r#"{"type":"publish","topic":"page:1","payload":{"x":1.5,"y":2}}"#;
        assert!(safe_validate_message(&schema, ok).is_valid());

        let bad = r#"{"type":"publish","topic":"page:1","payload":{"x":"left"}}"#;
        let result = safe_validate_message(&schema, bad);
        let issues = result.issues().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path.as_deref(), Some("payload"));
    }

    #[test]
    fn test_closure_payload_validator() {
        let schema = EnvelopeSchema::new().payload(|payload: &Value| {
            if payload.is_object() {
                Vec::new()
            } else {
                vec![Issue::root("expected an object")]
            }
        });
        let result = safe_validate_message(&schema, r#"{"type":"publish","topic":"t","payload":3}"#);
        assert_eq!(
            result,
            Validation::Invalid(vec![Issue::at("payload", "expected an object")])
        );
    }

    #[test]
    fn test_safe_validate_malformed_has_issue() {
        let result = safe_validate_message(&EnvelopeSchema::default(), "{not json");
        let issues = result.issues().unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.starts_with("malformed JSON"));
    }

    struct RejectAll;

    impl Schema for RejectAll {
        type Output = ();

        fn validate(&self, _value: &Value) -> Result<(), Vec<Issue>> {
            Err(Vec::new())
        }
    }

    #[test]
    fn test_silent_rejection_still_reports_an_issue() {
        let issues = safe_validate_message(&RejectAll, r#"{"type":"subscribe","topic":"t"}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(issues, vec![Issue::root("rejected by schema")]);

        match validate_message(&RejectAll, "{}") {
            Err(CodecError::Invalid(issues)) => assert_eq!(issues.len(), 1),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_into_result_on_valid_message() {
        let envelope = safe_validate_message(&EnvelopeSchema::default(), r#"{"type":"unsubscribe","topic":"t"}"#)
            .into_result()
            .unwrap();
        assert_eq!(envelope, Envelope::Unsubscribe { topic: "t".into() });
    }

    #[test]
    fn test_parse_message_falls_back_to_text() {
        assert_eq!(parse_message("hello"), ParsedMessage::Text("hello".into()));
        assert_eq!(parse_message(r#"{"a":1}"#), ParsedMessage::Json(json!({"a": 1})));
    }

    #[test]
    fn test_server_frame_encoding() {
        let frame = ServerFrame::new("session", json!({"users": 2}));
        let decoded: ServerFrame = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_issue_display() {
        assert_eq!(Issue::at("topic", "missing").to_string(), "topic: missing");
        assert_eq!(Issue::root("x").nested("payload").nested("data").to_string(), "data.payload: x");
    }
}
