//! Read-mostly catalog index.
//!
//! Built once at startup from a CSV snapshot of the known-card catalog.
//! Secondary maps cover every lookup the resolver needs: exact canonical
//! key, set id, set alias (ptcgo code or normalized set name), normalized
//! card name, and National Pokédex number.

use crate::fuzzy;
use crate::normalize::{canonical_key, normalize};
use anyhow::{Context, Result};
use cardmint_protocol::fields::Rarity;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One known card, read-only after index build.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogCard {
    pub id: String,
    pub name: String,
    pub set_id: String,
    pub set_name: String,
    pub ptcgo_code: Option<String>,
    /// Collector number as printed ("58", "SWSH045").
    pub number: String,
    pub printed_total: Option<u32>,
    pub rarity: Option<Rarity>,
    pub hp: Option<u16>,
    pub card_type: Option<String>,
    pub dex_numbers: Vec<u16>,
    pub release_date: Option<NaiveDate>,
    pub artist: Option<String>,
}

/// Raw CSV row shape of the catalog snapshot.
#[derive(Debug, Deserialize)]
struct CatalogRow {
    id: String,
    name: String,
    set_id: String,
    set_name: String,
    #[serde(default)]
    ptcgo_code: String,
    number: String,
    #[serde(default)]
    printed_total: Option<u32>,
    #[serde(default)]
    rarity: String,
    #[serde(default)]
    hp: Option<u16>,
    #[serde(default)]
    card_type: String,
    /// Semicolon-separated National Dex numbers.
    #[serde(default)]
    dex_numbers: String,
    #[serde(default)]
    release_date: String,
    #[serde(default)]
    artist: String,
}

#[derive(Debug, Default)]
pub struct CatalogIndex {
    cards: Vec<CatalogCard>,
    /// catalog id -> card index
    by_id: HashMap<String, usize>,
    /// canonical_key -> card index
    by_key: HashMap<String, usize>,
    /// set_id -> card indices
    by_set: HashMap<String, Vec<usize>>,
    /// alias (ptcgo code, normalized set name, collision variants) -> set_id
    set_aliases: HashMap<String, String>,
    /// normalized card name -> card indices
    by_name: HashMap<String, Vec<usize>>,
    /// National Dex number -> species names
    species_by_dex: HashMap<u16, Vec<String>>,
    /// normalized species name -> dex numbers
    dex_by_species: HashMap<String, Vec<u16>>,
}

impl CatalogIndex {
    /// Build the index from a CSV snapshot.
    pub fn from_csv<R: Read>(reader: R) -> Result<CatalogIndex> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut index = CatalogIndex::default();

        for (line, row) in csv_reader.deserialize::<CatalogRow>().enumerate() {
            let row = row.with_context(|| format!("Bad catalog row at line {}", line + 2))?;
            index.insert(row);
        }

        info!(
            cards = index.cards.len(),
            sets = index.by_set.len(),
            "Catalog index built"
        );
        Ok(index)
    }

    fn insert(&mut self, row: CatalogRow) {
        let dex_numbers: Vec<u16> = row
            .dex_numbers
            .split(';')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        let card = CatalogCard {
            id: row.id,
            name: row.name,
            set_id: row.set_id,
            set_name: row.set_name,
            ptcgo_code: (!row.ptcgo_code.is_empty()).then_some(row.ptcgo_code),
            number: row.number,
            printed_total: row.printed_total,
            rarity: Rarity::parse(&row.rarity),
            hp: row.hp,
            card_type: (!row.card_type.is_empty()).then_some(row.card_type),
            dex_numbers,
            release_date: NaiveDate::parse_from_str(&row.release_date, "%Y-%m-%d").ok(),
            artist: (!row.artist.is_empty()).then_some(row.artist),
        };

        let idx = self.cards.len();
        self.by_id.insert(card.id.clone(), idx);
        let key = canonical_key(&card.set_id, &card.number, &card.name);
        self.by_key.insert(key, idx);
        // Set-name keys resolve too; collisions keep the first entry.
        let name_key = canonical_key(&card.set_name, &card.number, &card.name);
        self.by_key.entry(name_key).or_insert(idx);

        self.by_set
            .entry(card.set_id.clone())
            .or_default()
            .push(idx);

        let set_name_alias = normalize(&card.set_name);
        self.set_aliases
            .entry(set_name_alias)
            .or_insert_with(|| card.set_id.clone());
        if let Some(code) = &card.ptcgo_code {
            self.set_aliases
                .entry(normalize(code))
                .or_insert_with(|| card.set_id.clone());
        }

        let norm_name = normalize(&card.name);
        self.by_name.entry(norm_name.clone()).or_default().push(idx);

        for dex in &card.dex_numbers {
            let species = self.species_by_dex.entry(*dex).or_default();
            if !species.contains(&norm_name) {
                species.push(norm_name.clone());
            }
            let numbers = self.dex_by_species.entry(norm_name.clone()).or_default();
            if !numbers.contains(dex) {
                numbers.push(*dex);
            }
        }

        self.cards.push(card);
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn card(&self, idx: usize) -> &CatalogCard {
        &self.cards[idx]
    }

    /// Exact canonical-key lookup.
    pub fn exact(&self, key: &str) -> Option<&CatalogCard> {
        self.by_key.get(key).map(|&idx| &self.cards[idx])
    }

    /// Lookup by stable catalog id.
    pub fn card_by_id(&self, id: &str) -> Option<&CatalogCard> {
        self.by_id.get(id).map(|&idx| &self.cards[idx])
    }

    /// Printed set total for a catalog id, when known.
    pub fn exact_total(&self, id: &str) -> Option<u32> {
        self.card_by_id(id).and_then(|card| card.printed_total)
    }

    /// All cards in a set, in snapshot order.
    pub fn set_cards(&self, set_id: &str) -> impl Iterator<Item = &CatalogCard> {
        self.by_set
            .get(set_id)
            .into_iter()
            .flatten()
            .map(|&idx| &self.cards[idx])
    }

    /// Resolve a set hint through id, alias, then fuzzy set name.
    pub fn resolve_set<'a>(&'a self, hint: &'a str) -> Option<&'a str> {
        if self.by_set.contains_key(hint) {
            return Some(hint);
        }
        let norm = normalize(hint);
        if let Some(set_id) = self.set_aliases.get(&norm) {
            return Some(set_id);
        }
        // Fuzzy over alias names as a last resort; ties break by set id so
        // repeated lookups stay deterministic.
        let mut best: Option<(&str, f64)> = None;
        for (alias, set_id) in &self.set_aliases {
            let score = fuzzy::similarity(&norm, alias);
            if score < fuzzy::SUGGEST_MATCH {
                continue;
            }
            let better = match best {
                Some((prev_id, prev)) => {
                    score > prev || (score == prev && set_id.as_str() < prev_id)
                }
                None => true,
            };
            if better {
                best = Some((set_id, score));
            }
        }
        best.map(|(set_id, _)| set_id)
    }

    /// Cards whose normalized name matches exactly or fuzzily, with the
    /// match score. Deterministic: sorted by score desc, then card id.
    pub fn by_name_fuzzy(&self, name: &str) -> Vec<(&CatalogCard, f64)> {
        let norm = normalize(name);
        let mut hits: Vec<(&CatalogCard, f64)> = Vec::new();

        if let Some(indices) = self.by_name.get(&norm) {
            hits.extend(indices.iter().map(|&idx| (&self.cards[idx], 1.0)));
        } else {
            for (candidate_name, indices) in &self.by_name {
                let score = fuzzy::similarity(&norm, candidate_name);
                if score >= fuzzy::SUGGEST_MATCH {
                    hits.extend(indices.iter().map(|&idx| (&self.cards[idx], score)));
                }
            }
        }

        hits.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits
    }

    /// Species names known under a National Dex number.
    pub fn species_for_dex(&self, dex: u16) -> &[String] {
        self.species_by_dex
            .get(&dex)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// National Dex numbers for a species name.
    pub fn dex_for_species(&self, name: &str) -> &[u16] {
        self.dex_by_species
            .get(&normalize(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Atomically swappable index handle for hot reload.
#[derive(Clone)]
pub struct CatalogHandle {
    inner: Arc<RwLock<Arc<CatalogIndex>>>,
}

impl CatalogHandle {
    pub fn new(index: CatalogIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogIndex> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn swap(&self, index: CatalogIndex) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(index);
    }
}

/// Small fixed catalog used by unit tests here and in dependent crates.
#[doc(hidden)]
pub fn test_catalog() -> CatalogIndex {
    let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-58,Pikachu,base1,Base Set,BS,58,102,common,60,Lightning,25,1999-01-09,Mitsuhiro Arita
base1-63,Squirtle,base1,Base Set,BS,63,102,common,40,Water,7,1999-01-09,Mitsuhiro Arita
base2-60,Pikachu,base2,Base Set 2,B2,60,130,common,60,Lightning,25,2000-02-24,Mitsuhiro Arita
neo1-25,Celebi,neo1,Neo Genesis,N1,25,111,rare_holo,50,Grass,251,2000-12-16,Hironobu Yoshida
base1-1,Alakazam,base1,Base Set,BS,1,102,rare_holo,80,Psychic,65,1999-01-09,Ken Sugimori
jungle-14,Nidoran F,jungle,Jungle,JU,14,64,common,60,Grass,29,1999-06-16,Ken Sugimori
";
    CatalogIndex::from_csv(csv.as_bytes()).unwrap()
}
