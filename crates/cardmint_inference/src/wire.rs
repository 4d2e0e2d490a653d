//! Strict wire schema for extractor responses.
//!
//! Both paths must produce this exact shape. Unknown fields, out-of-range
//! HP and off-enum rarity values are schema violations surfaced as
//! `INFER_PARSE`.

use cardmint_protocol::fields::{ExtractedFields, HoloType, Rarity};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("response does not match the extraction schema: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("hp {0} is out of range")]
    HpRange(i64),
    #[error("unknown rarity tier {0:?}")]
    Rarity(String),
    #[error("unknown holo type {0:?}")]
    Holo(String),
}

/// The exact response schema demanded from extractors.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireExtraction {
    pub name: String,
    pub hp: Option<i64>,
    pub set_number: Option<String>,
    pub set_name: Option<String>,
    pub first_edition_stamp: bool,
    pub shadowless: bool,
    pub holo_type: String,
    pub rarity: Option<String>,
    pub artist: Option<String>,
    pub card_type: Option<String>,
}

impl WireExtraction {
    /// JSON-schema fragment sent with primary requests.
    pub fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": [
                "name", "hp", "set_number", "set_name", "first_edition_stamp",
                "shadowless", "holo_type", "rarity", "artist", "card_type"
            ],
            "properties": {
                "name": { "type": "string" },
                "hp": { "type": ["integer", "null"], "minimum": 0 },
                "set_number": { "type": ["string", "null"] },
                "set_name": { "type": ["string", "null"] },
                "first_edition_stamp": { "type": "boolean" },
                "shadowless": { "type": "boolean" },
                "holo_type": { "enum": ["holo", "reverse_holo", "non_holo", "unknown"] },
                "rarity": {
                    "enum": [
                        "common", "uncommon", "rare", "rare_holo", "ultra_rare",
                        "secret_rare", "promo", "double_rare", null
                    ]
                },
                "artist": { "type": ["string", "null"] },
                "card_type": { "type": ["string", "null"] }
            }
        })
    }

    /// Validate a raw response body into extracted fields.
    pub fn into_fields(value: serde_json::Value) -> Result<ExtractedFields, WireError> {
        let wire: WireExtraction = serde_json::from_value(value)?;

        let hp = match wire.hp {
            None => None,
            Some(v) if (0..=i64::from(u16::MAX)).contains(&v) => Some(v as u16),
            Some(v) => return Err(WireError::HpRange(v)),
        };
        let rarity = match wire.rarity {
            None => None,
            Some(raw) => Some(Rarity::parse(&raw).ok_or(WireError::Rarity(raw))?),
        };
        let holo_type = match wire.holo_type.as_str() {
            "holo" => HoloType::Holo,
            "reverse_holo" => HoloType::ReverseHolo,
            "non_holo" => HoloType::NonHolo,
            "unknown" => HoloType::Unknown,
            other => return Err(WireError::Holo(other.to_string())),
        };

        Ok(ExtractedFields {
            name: (!wire.name.is_empty()).then_some(wire.name),
            hp,
            set_number: wire.set_number,
            set_name: wire.set_name,
            rarity,
            artist: wire.artist,
            card_type: wire.card_type,
            first_edition_stamp: wire.first_edition_stamp,
            shadowless: wire.shadowless,
            holo_type,
        })
    }
}
