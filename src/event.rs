use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::model::{Aircraft, Chase, User};
use crate::{Error, Result};

/// Stable subject names of the lifecycle events.
pub mod subjects {
    pub const CHASES_CREATED: &str = "chases.created";
    pub const CHASES_UPDATED: &str = "chases.updated";
    pub const CHASES_LIVE: &str = "chases.live";
    pub const CHASES_ENDED: &str = "chases.ended";
    pub const CHASES_DELETED: &str = "chases.deleted";
    pub const USERS_CREATED: &str = "users.created";
    pub const AIRCRAFT_UPDATED: &str = "aircraft.updated";

    pub const CHASES_ALL: &str = "chases.*";
    pub const USERS_ALL: &str = "users.*";
    pub const AIRCRAFT_ALL: &str = "aircraft.*";
}

/// A concrete, dot-delimited subject such as `chases.created`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    pub fn new(subject: impl Into<String>) -> Result<Self> {
        let subject = subject.into();
        if subject.is_empty() {
            return Err(Error::InvalidParameter("subject must not be empty".into()));
        }
        for token in subject.split('.') {
            if token.is_empty() || token == "*" || token == ">" || token.contains(' ') {
                return Err(Error::InvalidParameter(format!(
                    "invalid subject '{subject}'"
                )));
            }
        }
        Ok(Subject(subject))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First token, which names the stream holding this subject.
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Literal(String),
    /// `*`: exactly one token.
    Single,
    /// `>`: one or more trailing tokens.
    Tail,
}

/// A subscription filter. `*` matches one token, a trailing `>` matches the rest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let raw = pattern.into();
        let invalid = || Error::InvalidParameter(format!("invalid subject pattern '{raw}'"));
        if raw.is_empty() {
            return Err(invalid());
        }
        let parts: Vec<&str> = raw.split('.').collect();
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(invalid()),
                "*" => Token::Single,
                ">" if i + 1 == parts.len() => Token::Tail,
                ">" => return Err(invalid()),
                p if p.contains(['*', '>', ' ']) => return Err(invalid()),
                p => Token::Literal(p.to_string()),
            };
            tokens.push(token);
        }
        Ok(SubjectPattern { raw, tokens })
    }

    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split('.');
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some(),
                Token::Single => {
                    if parts.next().is_none_or(str::is_empty) {
                        return false;
                    }
                }
                Token::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }

    /// Literal first token, if any. Streams are keyed by it.
    pub fn root(&self) -> Option<&str> {
        match self.tokens.first() {
            Some(Token::Literal(lit)) => Some(lit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subject: Subject,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(subject: Subject, payload: Vec<u8>) -> Self {
        Event {
            subject,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Decode the payload as a typed envelope.
    pub fn decode<T: Entity>(&self) -> Result<Envelope<T>> {
        Envelope::from_json(&self.payload)
    }
}

/// An entity that can travel inside an [`Envelope`] under a fixed key.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const KEY: &'static str;
}

impl Entity for Chase {
    const KEY: &'static str = "chase";
}

impl Entity for User {
    const KEY: &'static str = "user";
}

impl Entity for Aircraft {
    const KEY: &'static str = "aircraft";
}

/// Self-describing payload: `{event, <entity key>: {...}, occurred_at}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T: Entity> {
    pub event: String,
    pub entity: T,
    pub occurred_at: DateTime<Utc>,
}

impl<T: Entity> Envelope<T> {
    pub fn new(subject: &str, entity: T) -> Self {
        Envelope {
            event: subject.to_string(),
            entity,
            occurred_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        map.insert("event".into(), Value::String(self.event.clone()));
        map.insert(T::KEY.into(), serde_json::to_value(&self.entity)?);
        map.insert(
            "occurred_at".into(),
            Value::String(self.occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        Ok(serde_json::to_vec(&Value::Object(map))?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let mut map: Map<String, Value> = serde_json::from_slice(bytes)?;
        let event: String = take_field(&mut map, "event")?;
        let entity: T = take_field(&mut map, T::KEY)?;
        let occurred_at: DateTime<Utc> = take_field(&mut map, "occurred_at")?;
        Ok(Envelope {
            event,
            entity,
            occurred_at,
        })
    }
}

fn take_field<V: DeserializeOwned>(map: &mut Map<String, Value>, key: &str) -> Result<V> {
    let value = map.remove(key).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChaseType;

    #[test]
    fn test_wildcard_matches_one_token() {
        let p = SubjectPattern::new("chases.*").unwrap();
        assert!(p.matches("chases.created"));
        assert!(p.matches("chases.updated"));
        assert!(!p.matches("users.created"));
        assert!(!p.matches("chases"));
        assert!(!p.matches("chases.created.extra"));
    }

    #[test]
    fn test_tail_wildcard() {
        let p = SubjectPattern::new("chases.>").unwrap();
        assert!(p.matches("chases.created"));
        assert!(p.matches("chases.a.b"));
        assert!(!p.matches("chases"));
        assert!(SubjectPattern::new(">").unwrap().matches("users.created"));
    }

    #[test]
    fn test_literal_pattern() {
        let p = SubjectPattern::new("users.created").unwrap();
        assert!(p.matches("users.created"));
        assert!(!p.matches("users.deleted"));
        assert_eq!(p.root(), Some("users"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(SubjectPattern::new("").is_err());
        assert!(SubjectPattern::new("chases..x").is_err());
        assert!(SubjectPattern::new("chases.>.x").is_err());
        assert!(SubjectPattern::new("chases.cr*").is_err());
        assert!(Subject::new("chases.*").is_err());
        assert!(Subject::new("chases.").is_err());
    }

    #[test]
    fn test_envelope_uses_entity_key() {
        let chase = Chase::new("Pursuit on I-5", ChaseType::Chase);
        let envelope = Envelope::new(subjects::CHASES_CREATED, chase.clone());
        let bytes = envelope.to_json().unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["event"], "chases.created");
        assert_eq!(raw["chase"]["id"], chase.id.to_string());
        assert!(raw["occurred_at"].as_str().unwrap().ends_with('Z'));

        let decoded = Envelope::<Chase>::from_json(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_missing_entity_is_error() {
        let bytes = br#"{"event":"chases.created","occurred_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(
            Envelope::<Chase>::from_json(bytes),
            Err(Error::Decode(_))
        ));
    }
}
