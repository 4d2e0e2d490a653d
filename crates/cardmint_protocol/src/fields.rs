//! Extracted card fields, candidates and operator-facing value types.

use serde::{Deserialize, Serialize};

// ============================================================================
// Printed rarity tiers
// ============================================================================

/// The eight printed rarity tiers. Extraction must produce one of these or
/// null; anything else is a schema violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    RareHolo,
    UltraRare,
    SecretRare,
    Promo,
    DoubleRare,
}

impl Rarity {
    pub const ALL: [Rarity; 8] = [
        Rarity::Common,
        Rarity::Uncommon,
        Rarity::Rare,
        Rarity::RareHolo,
        Rarity::UltraRare,
        Rarity::SecretRare,
        Rarity::Promo,
        Rarity::DoubleRare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::RareHolo => "rare_holo",
            Rarity::UltraRare => "ultra_rare",
            Rarity::SecretRare => "secret_rare",
            Rarity::Promo => "promo",
            Rarity::DoubleRare => "double_rare",
        }
    }

    /// Parse printed rarity text, tolerating spaces and case from OCR.
    pub fn parse(value: &str) -> Option<Rarity> {
        let folded = value.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Rarity::ALL.iter().copied().find(|r| r.as_str() == folded)
    }
}

// ============================================================================
// Variant markers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HoloType {
    Holo,
    ReverseHolo,
    NonHolo,
    #[default]
    Unknown,
}

impl HoloType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoloType::Holo => "holo",
            HoloType::ReverseHolo => "reverse_holo",
            HoloType::NonHolo => "non_holo",
            HoloType::Unknown => "unknown",
        }
    }
}

/// Closed set of variant hints an operator may apply on the edit surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantHint {
    FirstEdition,
    Shadowless,
    Holo,
    ReverseHolo,
    NonHolo,
    Unlimited,
}

impl VariantHint {
    pub const ALL: [VariantHint; 6] = [
        VariantHint::FirstEdition,
        VariantHint::Shadowless,
        VariantHint::Holo,
        VariantHint::ReverseHolo,
        VariantHint::NonHolo,
        VariantHint::Unlimited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantHint::FirstEdition => "first_edition",
            VariantHint::Shadowless => "shadowless",
            VariantHint::Holo => "holo",
            VariantHint::ReverseHolo => "reverse_holo",
            VariantHint::NonHolo => "non_holo",
            VariantHint::Unlimited => "unlimited",
        }
    }

    pub fn parse(value: &str) -> Option<VariantHint> {
        VariantHint::ALL.iter().copied().find(|v| v.as_str() == value)
    }
}

// ============================================================================
// Extracted fields
// ============================================================================

/// One inference attempt's view of the card. Created once per attempt and
/// overwritten only on explicit re-inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractedFields {
    pub name: Option<String>,
    /// None = non-Pokémon card (no HP box). Negative values are rejected at
    /// ingress, not representable here.
    pub hp: Option<u16>,
    /// As printed: "NNN" or "NNN/TTT". The original string is preserved; the
    /// collector portion is normalized separately for matching.
    pub set_number: Option<String>,
    pub set_name: Option<String>,
    pub rarity: Option<Rarity>,
    pub artist: Option<String>,
    pub card_type: Option<String>,
    #[serde(default)]
    pub first_edition_stamp: bool,
    #[serde(default)]
    pub shadowless: bool,
    #[serde(default)]
    pub holo_type: HoloType,
}

impl ExtractedFields {
    /// Variant tags derived from the markers, in the order downstream
    /// inventory expects them.
    pub fn variant_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        if self.first_edition_stamp {
            tags.push("first_edition".to_string());
        }
        if self.shadowless {
            tags.push("shadowless".to_string());
        }
        if self.holo_type != HoloType::Unknown {
            tags.push(self.holo_type.as_str().to_string());
        }
        tags
    }
}

// ============================================================================
// Candidates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    ExactMatch,
    FuzzyName,
    Structural,
    SetTriangulation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub catalog_id: String,
    pub title: String,
    pub confidence: f64,
    pub thumbnail: Option<String>,
    pub source: CandidateSource,
    #[serde(default)]
    pub auto_confirm: bool,
    /// Short tags indicating what matched ("number", "set", "hp", ...).
    #[serde(default)]
    pub signals: Vec<String>,
}

/// Overall verdict for a resolver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverDecision {
    AcceptAuto,
    NeedsOperator,
    NoReasonableCandidate,
}

// ============================================================================
// Truth core
// ============================================================================

/// Operator-locked fields persisted on ACCEPTED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthCore {
    pub accepted_name: String,
    pub accepted_hp: Option<u16>,
    pub accepted_collector_no: Option<String>,
    pub accepted_set_name: Option<String>,
    pub accepted_set_size: Option<u32>,
    pub accepted_variant_tags: Vec<String>,
}
