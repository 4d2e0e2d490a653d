//! National Pokédex false-match filter.
//!
//! The reference source embeds National Dex numbers in product titles
//! ("Celebi #251 [Neo Genesis]"), which collide with collector numbers. When
//! the `#NNN` in a candidate's source title is the National Dex number of a
//! species named in that title, and the candidate's own card number equals
//! that Dex number, the set-number mismatch penalty is suppressed.
//!
//! Only the `"Name #NNN ..."` title shape is recognized; other shapes keep
//! the penalty.

use anyhow::Result;
use cardmint_catalog::normalize::{normalize, normalize_collector_number};
use cardmint_catalog::{CatalogCard, ReferenceStore};
use regex::Regex;
use std::sync::OnceLock;

fn title_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(\d{1,4})").expect("static regex"))
}

/// Whether the candidate's number mismatch is a documented Dex false
/// positive rather than real evidence against the card.
pub fn suppress_number_penalty(card: &CatalogCard, reference: &ReferenceStore) -> Result<bool> {
    let Some(record) = reference.lookup(&card.set_name, &card.number, &card.name)? else {
        return Ok(false);
    };
    Ok(title_matches_dex(&record.title, card))
}

fn title_matches_dex(title: &str, card: &CatalogCard) -> bool {
    let Some(caps) = title_number_re().captures(title) else {
        return false;
    };
    let Ok(title_number) = caps[1].parse::<u16>() else {
        return false;
    };

    // The candidate's card number must be the Dex number embedded in the
    // title, and a species carrying that Dex number must be named there.
    if normalize_collector_number(&card.number) != title_number.to_string() {
        return false;
    }
    let norm_title = normalize(title);
    card.dex_numbers.contains(&title_number)
        && norm_title.contains(&normalize(&card.name))
}
