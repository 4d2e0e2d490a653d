//! Candidate generation and structural scoring.
//!
//! Weighted evidence fusion: name similarity 40%, card-number match 25%,
//! set match 20%, HP match 10%, rarity match 5%. Only weights with evidence
//! on both sides participate; the final confidence divides by the active
//! weight so missing fields widen rather than sink a candidate.

use crate::dex;
use anyhow::Result;
use cardmint_catalog::normalize::{normalize, normalize_collector_number, printed_total};
use cardmint_catalog::{fuzzy, CatalogCard, CatalogIndex, ReferenceStore};
use cardmint_protocol::fields::{CandidateSource, ExtractedFields};
use chrono::Datelike;

const WEIGHT_NAME: f64 = 0.40;
const WEIGHT_NUMBER: f64 = 0.25;
const WEIGHT_SET: f64 = 0.20;
const WEIGHT_HP: f64 = 0.10;
const WEIGHT_RARITY: f64 = 0.05;

/// Exact canonical hit baseline; bonuses stack on top.
const EXACT_BASE: f64 = 0.95;
/// Printed-total agreement bonus on an exact hit.
const EXACT_TOTAL_BONUS: f64 = 0.01;
/// Known-product bonus when the reference table has the row.
const EXACT_REFERENCE_BONUS: f64 = 0.02;

/// Internal scored candidate, carrying the catalog evidence Path C needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub card_id: String,
    pub title: String,
    pub confidence: f64,
    pub source: CandidateSource,
    pub signals: Vec<String>,
    // Evidence for set triangulation.
    pub norm_name: String,
    pub collector: String,
    pub set_id: String,
    pub set_name: String,
    pub rarity: Option<cardmint_protocol::fields::Rarity>,
    pub artist: Option<String>,
    pub card_type: Option<String>,
    pub release_year: Option<i32>,
}

/// Generate and score candidates, sorted non-increasing by confidence with
/// ties broken by catalog id.
pub fn score_candidates(
    fields: &ExtractedFields,
    catalog: &CatalogIndex,
    reference: &ReferenceStore,
) -> Result<Vec<ScoredCandidate>> {
    let Some(name) = fields.name.as_deref() else {
        return Ok(Vec::new());
    };

    let pool = catalog.by_name_fuzzy(name);
    let resolved_set = fields
        .set_name
        .as_deref()
        .and_then(|hint| catalog.resolve_set(hint))
        .map(str::to_string);

    let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(pool.len());
    for (card, name_score) in pool {
        scored.push(score_one(
            fields,
            card,
            name_score,
            resolved_set.as_deref(),
            reference,
        )?);
    }

    promote_exact(fields, catalog, reference, &mut scored)?;

    scored.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.card_id.cmp(&b.card_id))
    });
    Ok(scored)
}

fn score_one(
    fields: &ExtractedFields,
    card: &CatalogCard,
    name_score: f64,
    resolved_set: Option<&str>,
    reference: &ReferenceStore,
) -> Result<ScoredCandidate> {
    let mut sum = 0.0;
    let mut active = 0.0;
    let mut signals = Vec::new();

    // Name.
    sum += name_score * WEIGHT_NAME;
    active += WEIGHT_NAME;
    if name_score >= fuzzy::STRONG_MATCH {
        signals.push("name".to_string());
    }

    // Collector number, with the National Dex false-match exception.
    if let Some(number) = fields.set_number.as_deref() {
        let matches =
            normalize_collector_number(number) == normalize_collector_number(&card.number);
        if matches {
            sum += WEIGHT_NUMBER;
            active += WEIGHT_NUMBER;
            signals.push("number".to_string());
        } else if dex::suppress_number_penalty(card, reference)? {
            // Documented false positive: the source embeds National Dex
            // numbers in product names. No penalty for this candidate.
            signals.push("dex_exception".to_string());
        } else {
            active += WEIGHT_NUMBER;
        }
    }

    // Set.
    if let Some(set_hint) = fields.set_name.as_deref() {
        active += WEIGHT_SET;
        let set_score = if resolved_set == Some(card.set_id.as_str()) {
            1.0
        } else {
            let similarity = fuzzy::similarity(&normalize(set_hint), &normalize(&card.set_name));
            if similarity >= fuzzy::SUGGEST_MATCH {
                similarity
            } else {
                0.0
            }
        };
        sum += set_score * WEIGHT_SET;
        if set_score >= fuzzy::STRONG_MATCH {
            signals.push("set".to_string());
        }
    }

    // HP.
    if let (Some(hp), Some(card_hp)) = (fields.hp, card.hp) {
        active += WEIGHT_HP;
        if hp == card_hp {
            sum += WEIGHT_HP;
            signals.push("hp".to_string());
        }
    }

    // Rarity.
    if let (Some(rarity), Some(card_rarity)) = (fields.rarity, card.rarity) {
        active += WEIGHT_RARITY;
        if rarity == card_rarity {
            sum += WEIGHT_RARITY;
            signals.push("rarity".to_string());
        }
    }

    let confidence = if active > 0.0 { sum / active } else { 0.0 };
    let source = if active > WEIGHT_NAME {
        CandidateSource::Structural
    } else {
        CandidateSource::FuzzyName
    };

    Ok(ScoredCandidate {
        card_id: card.id.clone(),
        title: format!("{} #{} [{}]", card.name, card.number, card.set_name),
        confidence,
        source,
        signals,
        norm_name: normalize(&card.name),
        collector: normalize_collector_number(&card.number),
        set_id: card.set_id.clone(),
        set_name: card.set_name.clone(),
        rarity: card.rarity,
        artist: card.artist.clone(),
        card_type: card.card_type.clone(),
        release_year: card.release_date.map(|d| d.year()),
    })
}

/// Promote an unambiguous exact canonical hit to the exact-match tier.
///
/// With a set hint the canonical key is looked up directly; without one the
/// printed total of "NNN/TTT" disambiguates among same-name same-number
/// cards. Only a unique survivor is promoted.
fn promote_exact(
    fields: &ExtractedFields,
    catalog: &CatalogIndex,
    reference: &ReferenceStore,
    scored: &mut [ScoredCandidate],
) -> Result<()> {
    let (Some(name), Some(number)) = (fields.name.as_deref(), fields.set_number.as_deref()) else {
        return Ok(());
    };

    let exact_id: Option<String> = if let Some(set_hint) = fields.set_name.as_deref() {
        let key = cardmint_catalog::canonical_key(set_hint, number, name);
        catalog.exact(&key).map(|card| card.id.clone())
    } else {
        let want_collector = normalize_collector_number(number);
        let want_name = normalize(name);
        let total = printed_total(number);
        let mut hits = scored.iter().filter(|s| {
            s.norm_name == want_name
                && s.collector == want_collector
                && match total {
                    Some(t) => catalog
                        .exact_total(&s.card_id)
                        .map(|card_total| card_total == t)
                        .unwrap_or(false),
                    None => true,
                }
        });
        let first = hits.next().map(|s| s.card_id.clone());
        if hits.next().is_some() {
            None // ambiguous, leave to structural scoring
        } else {
            first
        }
    };

    let Some(exact_id) = exact_id else {
        return Ok(());
    };
    let Some(candidate) = scored.iter_mut().find(|s| s.card_id == exact_id) else {
        return Ok(());
    };

    let mut confidence = EXACT_BASE;
    if let Some(total) = printed_total(number) {
        let agrees = catalog
            .exact_total(&exact_id)
            .map(|card_total| card_total == total)
            .unwrap_or(false);
        if agrees {
            confidence += EXACT_TOTAL_BONUS;
        }
    }
    if reference
        .lookup(&candidate.set_name, number, name)?
        .is_some()
    {
        confidence += EXACT_REFERENCE_BONUS;
    }

    candidate.confidence = candidate.confidence.max(confidence);
    candidate.source = CandidateSource::ExactMatch;
    if !candidate.signals.iter().any(|s| s == "exact") {
        candidate.signals.insert(0, "exact".to_string());
    }
    Ok(())
}
