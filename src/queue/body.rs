//! Typed, replayable mutation bodies.
//!
//! A queued mutation must be reconstructible long after the original request
//! object is gone, so the body is persisted as a tagged variant rather than
//! re-derived from a content-type header at replay time. File fields keep
//! their byte content together with the original name and modification
//! timestamp; reconstruction is exact, not approximate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialized request body of a queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationBody {
  /// A JSON document, stored as its source text
  Json { text: String },
  /// Plain text
  Text { text: String },
  /// Multipart form fields in submission order
  Form { fields: Vec<FormField> },
}

/// One multipart form field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FormField {
  /// Inline string value
  Value { name: String, value: String },
  /// File payload captured for byte-exact replay
  File {
    name: String,
    file_name: String,
    size: u64,
    last_modified: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    content: Vec<u8>,
  },
}

impl FormField {
  /// Build a file field from raw content, capturing size alongside the bytes.
  pub fn file(
    name: impl Into<String>,
    file_name: impl Into<String>,
    last_modified: DateTime<Utc>,
    content: Vec<u8>,
  ) -> Self {
    Self::File {
      name: name.into(),
      file_name: file_name.into(),
      size: content.len() as u64,
      last_modified,
      content,
    }
  }
}

impl MutationBody {
  /// Approximate persisted size, used for queue bookkeeping.
  pub fn estimated_size(&self) -> u64 {
    match self {
      Self::Json { text } | Self::Text { text } => text.len() as u64,
      Self::Form { fields } => fields
        .iter()
        .map(|f| match f {
          FormField::Value { name, value } => (name.len() + value.len()) as u64,
          FormField::File { size, .. } => *size,
        })
        .sum(),
    }
  }
}

/// Base64 (de)serialization for raw file bytes. JSON has no byte-string
/// type, and a number-array encoding triples the persisted size.
mod base64_bytes {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine as _;
  use serde::de::Error;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_field_round_trip_is_exact() {
    // Every byte value, deliberately not valid UTF-8
    let content: Vec<u8> = (0u8..=255).collect();
    let modified = Utc::now();
    let field = FormField::file("file", "voice_note_20241130.webm", modified, content.clone());

    let body = MutationBody::Form {
      fields: vec![
        field,
        FormField::Value {
          name: "session_id".to_string(),
          value: "sess_abc123".to_string(),
        },
      ],
    };

    let encoded = serde_json::to_string(&body).unwrap();
    let decoded: MutationBody = serde_json::from_str(&encoded).unwrap();

    match &decoded {
      MutationBody::Form { fields } => match &fields[0] {
        FormField::File {
          file_name,
          size,
          last_modified,
          content: restored,
          ..
        } => {
          assert_eq!(restored, &content);
          assert_eq!(file_name, "voice_note_20241130.webm");
          assert_eq!(*size, 256);
          assert_eq!(last_modified.timestamp_millis(), modified.timestamp_millis());
        }
        other => panic!("expected file field, got {:?}", other),
      },
      other => panic!("expected form body, got {:?}", other),
    }
    assert_eq!(decoded, body);
  }

  #[test]
  fn test_json_and_text_round_trip() {
    for body in [
      MutationBody::Json {
        text: r##"{"markdown":"# Note","folder":"inbox"}"##.to_string(),
      },
      MutationBody::Text {
        text: "plain draft text".to_string(),
      },
    ] {
      let encoded = serde_json::to_string(&body).unwrap();
      let decoded: MutationBody = serde_json::from_str(&encoded).unwrap();
      assert_eq!(decoded, body);
    }
  }

  #[test]
  fn test_estimated_size_counts_file_bytes() {
    let body = MutationBody::Form {
      fields: vec![FormField::file("file", "a.webm", Utc::now(), vec![0u8; 1024])],
    };
    assert_eq!(body.estimated_size(), 1024);
  }
}
