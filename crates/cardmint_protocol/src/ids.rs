//! Identifier wrappers for CardMint.
//!
//! Every id carries a kind tag in its string form (`scan_<uuid>`,
//! `proc_<uuid>`, ...) so a job id pasted into a log search or a webhook
//! payload is self-describing, and a session id can never be accepted where
//! a scan id is expected. The payload is a v4 UUID; `parse` rejects other
//! versions since nothing in the pipeline mints them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing a tagged identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    kind: &'static str,
    reason: String,
}

impl IdParseError {
    fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} id: {}", self.kind, self.reason)
    }
}

impl std::error::Error for IdParseError {}

/// Validate the UUID payload of an id: well-formed and version 4.
fn parse_uuid_payload(kind: &'static str, raw: &str) -> Result<Uuid, IdParseError> {
    let uuid = Uuid::try_parse(raw).map_err(|e| IdParseError::new(kind, e.to_string()))?;
    if uuid.get_version_num() != 4 {
        return Err(IdParseError::new(
            kind,
            format!("expected a v4 UUID, got version {}", uuid.get_version_num()),
        ));
    }
    Ok(uuid)
}

macro_rules! define_tagged_id {
    ($name:ident, $kind:literal, $tag:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Kind tag prefixed to the string form.
            pub const TAG: &'static str = $tag;

            /// Mint a fresh id, e.g. `scan_3f2c...` (hyphenless v4 payload).
            pub fn new() -> Self {
                Self(format!("{}_{}", $tag, Uuid::new_v4().simple()))
            }

            /// Parse the tagged form this type mints. Untagged v4 UUIDs from
            /// rows written before tagging are accepted and re-tagged; a
            /// different kind tag is rejected outright.
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let payload = match value.split_once('_') {
                    Some(($tag, rest)) => rest,
                    Some((other, _)) => {
                        return Err(IdParseError::new(
                            $kind,
                            format!("kind tag {other:?} does not belong to a {} id", $kind),
                        ));
                    }
                    None => value,
                };
                let uuid = parse_uuid_payload($kind, payload)?;
                Ok(Self(format!("{}_{}", $tag, uuid.simple())))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

define_tagged_id!(JobId, "scan job", "scan");
define_tagged_id!(SessionId, "operator session", "sess");
define_tagged_id!(ProcessorId, "processor", "proc");
define_tagged_id!(EventId, "event", "evt");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_their_tag_and_parse_back() {
        let id = JobId::new();
        assert!(id.as_str().starts_with("scan_"));
        assert_eq!(JobId::parse(id.as_str()).unwrap(), id);

        let session = SessionId::new();
        assert!(session.as_str().starts_with("sess_"));
    }

    #[test]
    fn wrong_kind_tag_is_rejected() {
        let session = SessionId::new();
        let err = JobId::parse(session.as_str()).unwrap_err();
        assert!(err.to_string().contains("scan job"));
    }

    #[test]
    fn untagged_v4_uuid_is_retagged() {
        let raw = Uuid::new_v4();
        let id = ProcessorId::parse(&raw.to_string()).unwrap();
        assert_eq!(id.as_str(), format!("proc_{}", raw.simple()));
    }

    #[test]
    fn non_v4_payload_is_rejected() {
        // The nil UUID is version 0.
        let err = JobId::parse("scan_00000000000000000000000000000000").unwrap_err();
        assert!(err.to_string().contains("expected a v4 UUID"));
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn serde_round_trips_as_a_tagged_string() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_str()));
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let err = serde_json::from_str::<JobId>(&json).unwrap_err();
        assert!(err.to_string().contains("scan job"));
    }
}
