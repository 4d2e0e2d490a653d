//! Identity resolver.
//!
//! A pure function over extracted fields, the catalog index and the
//! reference price table. Produces a ranked candidate list, a Path C
//! disambiguation verdict when sets compete, and an overall decision.
//! Given identical inputs and catalog the output is byte-identical.

mod dex;
mod pathc;
mod score;

pub use pathc::PathCOutcome;
pub use score::ScoredCandidate;

use anyhow::Result;
use cardmint_catalog::{CatalogIndex, ReferenceStore};
use cardmint_protocol::config::ResolverConfig;
use cardmint_protocol::fields::{Candidate, ExtractedFields, ResolverDecision};
use cardmint_protocol::timings::PathCTelemetry;
use tracing::debug;

/// Result of one resolver run.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Sorted non-increasing by confidence.
    pub candidates: Vec<Candidate>,
    pub decision: ResolverDecision,
    pub path_c: Option<PathCTelemetry>,
}

/// How many candidates are surfaced to the operator.
const TOP_N: usize = 5;

/// Resolve extracted fields against the catalog.
pub fn resolve(
    fields: &ExtractedFields,
    catalog: &CatalogIndex,
    reference: &ReferenceStore,
    cfg: &ResolverConfig,
) -> Result<Resolution> {
    let mut scored = score::score_candidates(fields, catalog, reference)?;

    let path_c = if cfg.path_c_enabled {
        let outcome = pathc::triangulate(fields, &mut scored, cfg);
        Some(outcome.telemetry)
    } else {
        None
    };

    scored.truncate(TOP_N);

    let mut candidates: Vec<Candidate> = scored
        .into_iter()
        .map(|s| Candidate {
            catalog_id: s.card_id,
            title: s.title,
            confidence: s.confidence,
            thumbnail: None,
            source: s.source,
            auto_confirm: false,
            signals: s.signals,
        })
        .collect();

    let decision = decide(&mut candidates, cfg);
    debug!(
        candidates = candidates.len(),
        decision = ?decision,
        "Resolver run complete"
    );

    Ok(Resolution {
        candidates,
        decision,
        path_c,
    })
}

/// Apply the acceptance thresholds and mark auto-confirm.
fn decide(candidates: &mut [Candidate], cfg: &ResolverConfig) -> ResolverDecision {
    let Some(top) = candidates.first().map(|c| c.confidence) else {
        return ResolverDecision::NoReasonableCandidate;
    };
    if top < cfg.reasonable_floor {
        return ResolverDecision::NoReasonableCandidate;
    }

    let runner_up = candidates.get(1).map(|c| c.confidence).unwrap_or(0.0);
    if top >= cfg.auto_accept && top - runner_up >= cfg.auto_accept_margin {
        candidates[0].auto_confirm = true;
        return ResolverDecision::AcceptAuto;
    }
    ResolverDecision::NeedsOperator
}
