//! Reference price lookup.
//!
//! The bulk reference CSV is parsed once on first use; lookups are memoized
//! per canonical product key in an LRU cache with a TTL, with a fuzzy
//! fallback that explores alias variants on a miss.

use crate::fuzzy;
use crate::normalize::{canonical_key, normalize, normalize_collector_number};
use anyhow::{Context, Result};
use lru::LruCache;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Prices for one product, keyed by condition/grade label.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRecord {
    pub key: String,
    /// Source product title, e.g. "Celebi #251 [Neo Genesis]". Kept verbatim
    /// for the National-Dex false-match exception.
    pub title: String,
    pub set: String,
    pub number: String,
    pub name: String,
    pub prices: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    set: String,
    number: String,
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    price_nm: Option<f64>,
    #[serde(default)]
    price_lp: Option<f64>,
    #[serde(default)]
    price_mp: Option<f64>,
    #[serde(default)]
    price_hp: Option<f64>,
    #[serde(default)]
    price_grade_9: Option<f64>,
    #[serde(default)]
    price_grade_10: Option<f64>,
}

struct Table {
    by_key: HashMap<String, Arc<ReferenceRecord>>,
    records: Vec<Arc<ReferenceRecord>>,
}

struct CacheEntry {
    record: Option<Arc<ReferenceRecord>>,
    inserted: Instant,
}

struct StoreState {
    table: Option<Arc<Table>>,
    cache: LruCache<String, CacheEntry>,
}

/// Lazily-loaded reference price store.
///
/// Reads are lock-free against the parsed table once the mutex-guarded
/// memo layer has been consulted; writes (cache fill, first parse) are
/// serialized.
pub struct ReferenceStore {
    csv_path: Option<PathBuf>,
    ttl: Duration,
    state: Mutex<StoreState>,
}

impl ReferenceStore {
    pub fn open(csv_path: Option<PathBuf>, lru_capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(lru_capacity.max(1)).expect("max(1) is non-zero");
        Self {
            csv_path,
            ttl,
            state: Mutex::new(StoreState {
                table: None,
                cache: LruCache::new(capacity),
            }),
        }
    }

    /// Look up a product by extracted (set, number, name).
    ///
    /// Deterministic within the TTL window: the same canonical key hits the
    /// same cached row.
    pub fn lookup(&self, set: &str, number: &str, name: &str) -> Result<Option<Arc<ReferenceRecord>>> {
        let key = canonical_key(set, number, name);
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = state.cache.get(&key) {
            if entry.inserted.elapsed() < self.ttl {
                return Ok(entry.record.clone());
            }
        }

        let table = match &state.table {
            Some(table) => table.clone(),
            None => {
                let table = Arc::new(self.parse_table()?);
                state.table = Some(table.clone());
                table
            }
        };

        let record = table
            .by_key
            .get(&key)
            .cloned()
            .or_else(|| fuzzy_pathway(&table, number, name));

        state.cache.put(
            key,
            CacheEntry {
                record: record.clone(),
                inserted: Instant::now(),
            },
        );
        Ok(record)
    }

    fn parse_table(&self) -> Result<Table> {
        let Some(path) = &self.csv_path else {
            debug!("No reference CSV configured; lookups always miss");
            return Ok(Table {
                by_key: HashMap::new(),
                records: Vec::new(),
            });
        };

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open reference CSV: {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(file);
        let mut by_key = HashMap::new();
        let mut records = Vec::new();

        for (line, row) in reader.deserialize::<ReferenceRow>().enumerate() {
            let row = row.with_context(|| format!("Bad reference row at line {}", line + 2))?;
            let mut prices = BTreeMap::new();
            for (label, value) in [
                ("nm", row.price_nm),
                ("lp", row.price_lp),
                ("mp", row.price_mp),
                ("hp", row.price_hp),
                ("grade_9", row.price_grade_9),
                ("grade_10", row.price_grade_10),
            ] {
                if let Some(price) = value {
                    prices.insert(label.to_string(), price);
                }
            }
            let key = canonical_key(&row.set, &row.number, &row.name);
            let record = Arc::new(ReferenceRecord {
                key: key.clone(),
                title: if row.title.is_empty() {
                    format!("{} #{} [{}]", row.name, row.number, row.set)
                } else {
                    row.title
                },
                set: row.set,
                number: row.number,
                name: row.name,
                prices,
            });
            by_key.entry(key).or_insert_with(|| record.clone());
            records.push(record);
        }

        info!(products = records.len(), "Reference table parsed");
        Ok(Table { by_key, records })
    }
}

/// Alias-variant fallback: same collector number, fuzzily-matching name.
fn fuzzy_pathway(table: &Table, number: &str, name: &str) -> Option<Arc<ReferenceRecord>> {
    let want_number = normalize_collector_number(number);
    let want_name = normalize(name);

    let mut best: Option<(Arc<ReferenceRecord>, f64)> = None;
    for record in &table.records {
        if normalize_collector_number(&record.number) != want_number {
            continue;
        }
        let score = fuzzy::similarity(&want_name, &normalize(&record.name));
        if score < fuzzy::SUGGEST_MATCH {
            continue;
        }
        let better = match &best {
            Some((prev, prev_score)) => {
                score > *prev_score || (score == *prev_score && record.key < prev.key)
            }
            None => true,
        };
        if better {
            best = Some((record.clone(), score));
        }
    }
    best.map(|(record, _)| record)
}
