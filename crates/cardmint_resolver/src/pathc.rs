//! Path C — set triangulation.
//!
//! When top candidates share a name and collector number but differ by set,
//! the secondary signals (rarity, artist, card type, release-year era)
//! vote on which set the physical card belongs to. Strong agreement
//! discards the losing sets; moderate agreement re-weights without
//! discarding; weak agreement leaves the list alone.

use crate::score::ScoredCandidate;
use cardmint_catalog::normalize::normalize;
use cardmint_protocol::config::ResolverConfig;
use cardmint_protocol::fields::ExtractedFields;
use cardmint_protocol::timings::{PathCAction, PathCTelemetry};
use std::collections::BTreeMap;
use std::time::Instant;

/// Fraction of the remaining headroom granted to matching-set candidates on
/// a soft rerank, scaled by the agreement confidence.
const SOFT_BOOST: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct PathCOutcome {
    pub telemetry: PathCTelemetry,
}

/// Run triangulation over the scored candidates, mutating order and
/// confidence in place when the agreement clears a threshold.
pub fn triangulate(
    fields: &ExtractedFields,
    scored: &mut Vec<ScoredCandidate>,
    cfg: &ResolverConfig,
) -> PathCOutcome {
    let started = Instant::now();

    let Some(group_sets) = competing_sets(scored) else {
        return skipped(started, false);
    };

    // Vote each competing set against the extracted signals.
    let mut votes: BTreeMap<&str, SetVote> = BTreeMap::new();
    for set_id in &group_sets {
        let representative = scored
            .iter()
            .find(|s| &s.set_id == set_id)
            .expect("set came from the candidate list");
        votes.insert(set_id, vote(fields, representative));
    }

    let mut ranked: Vec<(&str, &SetVote)> = votes.iter().map(|(k, v)| (*k, v)).collect();
    ranked.sort_by(|(a_id, a), (b_id, b)| {
        b.matches
            .cmp(&a.matches)
            .then_with(|| a_id.cmp(b_id))
    });

    let (winner_id, winner) = ranked[0];
    let runner_up_matches = ranked.get(1).map(|(_, v)| v.matches).unwrap_or(0);

    // The winner must clear the signal floor and actually beat the field.
    if winner.evaluable == 0
        || winner.matches < cfg.path_c_min_signals
        || winner.matches <= runner_up_matches
    {
        return skipped(started, true);
    }

    let confidence = winner.matches as f64 / winner.evaluable as f64;
    let winner_id = winner_id.to_string();
    let signals = winner.signal_names.clone();

    let action = if confidence >= cfg.path_c_hard_filter {
        let shares_group = |s: &ScoredCandidate| group_sets.contains(&s.set_id);
        scored.retain(|s| !shares_group(s) || s.set_id == winner_id);
        if scored.is_empty() {
            PathCAction::Discard
        } else {
            PathCAction::HardFilter
        }
    } else if confidence >= cfg.path_c_soft_rerank {
        for candidate in scored.iter_mut() {
            if group_sets.contains(&candidate.set_id) && candidate.set_id == winner_id {
                candidate.confidence += (1.0 - candidate.confidence) * confidence * SOFT_BOOST;
            }
        }
        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.card_id.cmp(&b.card_id))
        });
        PathCAction::SoftRerank
    } else {
        return skipped(started, true);
    };

    PathCOutcome {
        telemetry: PathCTelemetry {
            ran: true,
            action,
            confidence,
            set_hint: Some(winner_id),
            signals,
            latency_ms: started.elapsed().as_millis() as u64,
        },
    }
}

/// Sets competing for the top candidate's (name, collector) pair, present
/// when at least two distinct sets share it.
fn competing_sets(scored: &[ScoredCandidate]) -> Option<Vec<String>> {
    let top = scored.first()?;
    let mut sets: Vec<String> = scored
        .iter()
        .filter(|s| s.norm_name == top.norm_name && s.collector == top.collector)
        .map(|s| s.set_id.clone())
        .collect();
    sets.sort();
    sets.dedup();
    (sets.len() >= 2).then_some(sets)
}

struct SetVote {
    matches: usize,
    evaluable: usize,
    signal_names: Vec<String>,
}

fn vote(fields: &ExtractedFields, candidate: &ScoredCandidate) -> SetVote {
    let mut matches = 0;
    let mut evaluable = 0;
    let mut signal_names = Vec::new();

    if let (Some(rarity), Some(card_rarity)) = (fields.rarity, candidate.rarity) {
        evaluable += 1;
        if rarity == card_rarity {
            matches += 1;
            signal_names.push("rarity".to_string());
        }
    }
    if let (Some(artist), Some(card_artist)) = (fields.artist.as_deref(), candidate.artist.as_deref())
    {
        evaluable += 1;
        if normalize(artist) == normalize(card_artist) {
            matches += 1;
            signal_names.push("artist".to_string());
        }
    }
    if let (Some(card_type), Some(candidate_type)) =
        (fields.card_type.as_deref(), candidate.card_type.as_deref())
    {
        evaluable += 1;
        if normalize(card_type) == normalize(candidate_type) {
            matches += 1;
            signal_names.push("card_type".to_string());
        }
    }
    // Era heuristic: first-edition stamps and shadowless frames only exist
    // on the earliest print runs.
    if (fields.first_edition_stamp || fields.shadowless) && candidate.release_year.is_some() {
        evaluable += 1;
        if candidate.release_year.unwrap_or(i32::MAX) <= 2000 {
            matches += 1;
            signal_names.push("release_year".to_string());
        }
    }

    SetVote {
        matches,
        evaluable,
        signal_names,
    }
}

fn skipped(started: Instant, ran: bool) -> PathCOutcome {
    PathCOutcome {
        telemetry: PathCTelemetry {
            ran,
            action: PathCAction::Skipped,
            confidence: 0.0,
            set_hint: None,
            signals: Vec::new(),
            latency_ms: started.elapsed().as_millis() as u64,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardmint_catalog::CatalogIndex;
    use cardmint_catalog::ReferenceStore;
    use cardmint_protocol::fields::{HoloType, Rarity};
    use std::time::Duration;

    /// Same Pikachu, same collector number 58, two competing sets. The
    /// reprint dropped the first-edition era and swapped the artist.
    fn competing_catalog() -> CatalogIndex {
        let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-58,Pikachu,base1,Base Set,BS,58,102,common,60,Lightning,25,1999-01-09,Mitsuhiro Arita
rp-58,Pikachu,rp,Reprint Gallery,RG,58,150,rare,60,Lightning,25,2004-05-01,Another Artist
";
        CatalogIndex::from_csv(csv.as_bytes()).unwrap()
    }

    fn scored_for(fields: &ExtractedFields) -> Vec<ScoredCandidate> {
        let reference = ReferenceStore::open(None, 8, Duration::from_secs(60));
        crate::score::score_candidates(fields, &competing_catalog(), &reference).unwrap()
    }

    fn vintage_fields() -> ExtractedFields {
        ExtractedFields {
            name: Some("Pikachu".into()),
            hp: Some(60),
            set_number: Some("58".into()),
            set_name: None,
            rarity: Some(Rarity::Common),
            artist: Some("Mitsuhiro Arita".into()),
            card_type: Some("Lightning".into()),
            first_edition_stamp: true,
            shadowless: false,
            holo_type: HoloType::NonHolo,
        }
    }

    #[test]
    fn unanimous_signals_hard_filter() {
        let fields = vintage_fields();
        let mut scored = scored_for(&fields);
        assert_eq!(scored.len(), 2);

        let cfg = ResolverConfig::default();
        let outcome = triangulate(&fields, &mut scored, &cfg);

        // rarity + artist + card_type + era all point at Base Set: 4/4.
        assert_eq!(outcome.telemetry.action, PathCAction::HardFilter);
        assert_eq!(outcome.telemetry.set_hint.as_deref(), Some("base1"));
        assert!(outcome.telemetry.confidence >= cfg.path_c_hard_filter);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].set_id, "base1");
    }

    #[test]
    fn partial_agreement_soft_reranks() {
        // An OCR-misread collector number keeps both candidates under 1.0,
        // so the rerank boost is visible; artist + card type favor Base Set.
        let fields = ExtractedFields {
            name: Some("Pikachu".into()),
            hp: Some(60),
            set_number: Some("59".into()),
            artist: Some("Mitsuhiro Arita".into()),
            card_type: Some("Lightning".into()),
            ..Default::default()
        };
        let mut scored = scored_for(&fields);
        let before_top = scored[0].confidence;
        assert!(before_top < 1.0);

        let mut cfg = ResolverConfig::default();
        cfg.path_c_hard_filter = 1.1; // force the soft branch for the test
        let outcome = triangulate(&fields, &mut scored, &cfg);

        assert_eq!(outcome.telemetry.action, PathCAction::SoftRerank);
        assert_eq!(scored[0].set_id, "base1");
        assert!(scored[0].confidence > before_top);
        assert!(scored[0].confidence > scored[1].confidence);
        for pair in scored.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn tied_votes_skip() {
        // Only the shared card type is readable: both sets match 1/1.
        let fields = ExtractedFields {
            name: Some("Pikachu".into()),
            set_number: Some("58".into()),
            card_type: Some("Lightning".into()),
            ..Default::default()
        };
        let mut scored = scored_for(&fields);
        let cfg = ResolverConfig::default();
        let outcome = triangulate(&fields, &mut scored, &cfg);
        assert_eq!(outcome.telemetry.action, PathCAction::Skipped);
        assert!(outcome.telemetry.ran);
        assert_eq!(scored.len(), 2);
    }

    #[test]
    fn single_set_never_triangulates() {
        let fields = ExtractedFields {
            name: Some("Squirtle".into()),
            ..Default::default()
        };
        let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-63,Squirtle,base1,Base Set,BS,63,102,common,40,Water,7,1999-01-09,Mitsuhiro Arita
";
        let catalog = CatalogIndex::from_csv(csv.as_bytes()).unwrap();
        let reference = ReferenceStore::open(None, 8, Duration::from_secs(60));
        let mut scored = crate::score::score_candidates(&fields, &catalog, &reference).unwrap();

        let cfg = ResolverConfig::default();
        let outcome = triangulate(&fields, &mut scored, &cfg);
        assert_eq!(outcome.telemetry.action, PathCAction::Skipped);
        assert!(!outcome.telemetry.ran);
    }

    #[test]
    fn below_min_signals_skips() {
        // Artist alone agrees: 1 match < min_signals (2).
        let fields = ExtractedFields {
            name: Some("Pikachu".into()),
            set_number: Some("58".into()),
            artist: Some("Mitsuhiro Arita".into()),
            ..Default::default()
        };
        let mut scored = scored_for(&fields);
        let cfg = ResolverConfig::default();
        let outcome = triangulate(&fields, &mut scored, &cfg);
        assert_eq!(outcome.telemetry.action, PathCAction::Skipped);
    }
}
