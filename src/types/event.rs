//! Events handed to the broker after a successful cache mutation.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::model::{Target, TargetType};

/// Wire version written into every event envelope.
pub const EVENT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
  v: u8,
  #[serde(flatten)]
  body: T,
}

/// Event decoding error
#[derive(Debug)]
pub enum EventDecodeError {
  Malformed(serde_json::Error),
  UnsupportedVersion(u8),
}

impl std::fmt::Display for EventDecodeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventDecodeError::Malformed(e) => write!(f, "Malformed event payload: {}", e),
      EventDecodeError::UnsupportedVersion(v) => write!(f, "Unsupported event version: {}", v),
    }
  }
}

impl std::error::Error for EventDecodeError {}

fn encode<T: Serialize>(body: &T) -> Vec<u8> {
  // Plain structs of integers, strings and bools always serialize.
  serde_json::to_vec(&Envelope {
    v: EVENT_VERSION,
    body,
  })
  .unwrap_or_default()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EventDecodeError> {
  let envelope: Envelope<T> =
    serde_json::from_slice(bytes).map_err(EventDecodeError::Malformed)?;
  if envelope.v != EVENT_VERSION {
    return Err(EventDecodeError::UnsupportedVersion(envelope.v));
  }
  Ok(envelope.body)
}

/// A like or unlike that has been applied to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeChangedEvent {
  pub user_id: i64,
  pub target_id: i64,
  pub target_type: TargetType,
  pub timestamp_ms: i64,
  pub liked: bool,
}

impl LikeChangedEvent {
  pub fn new(user_id: i64, target: Target, liked: bool) -> Self {
    Self {
      user_id,
      target_id: target.id,
      target_type: target.kind,
      timestamp_ms: chrono::Utc::now().timestamp_millis(),
      liked,
    }
  }

  pub fn target(&self) -> Target {
    Target::new(self.target_id, self.target_type)
  }

  pub fn encode(&self) -> Vec<u8> {
    encode(self)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, EventDecodeError> {
    decode(bytes)
  }
}

/// One article view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewEvent {
  pub article_id: i64,
  pub timestamp_ms: i64,
}

impl ViewEvent {
  pub fn new(article_id: i64) -> Self {
    Self {
      article_id,
      timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    encode(self)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, EventDecodeError> {
    decode(bytes)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_like_event_wire_format() {
    let event = LikeChangedEvent {
      user_id: 5,
      target_id: 9,
      target_type: TargetType::Reply,
      timestamp_ms: 1000,
      liked: true,
    };
    let json: serde_json::Value = serde_json::from_slice(&event.encode()).unwrap();
    assert_eq!(json["v"], 1);
    assert_eq!(json["userId"], 5);
    assert_eq!(json["targetType"], "reply");
    assert_eq!(json["liked"], true);
  }

  #[test]
  fn test_decode_rejects_unknown_version() {
    let bytes = br#"{"v":2,"articleId":1,"timestampMs":5}"#;
    assert!(matches!(
      ViewEvent::decode(bytes),
      Err(EventDecodeError::UnsupportedVersion(2))
    ));
  }

  #[test]
  fn test_decode_rejects_garbage() {
    assert!(matches!(
      LikeChangedEvent::decode(b"not json"),
      Err(EventDecodeError::Malformed(_))
    ));
  }
}
