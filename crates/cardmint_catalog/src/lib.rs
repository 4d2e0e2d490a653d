//! Catalog and reference indices.
//!
//! Read-mostly, in-memory lookups over the known-card snapshot plus the
//! lazily-loaded reference price table. Built once at startup, swapped
//! atomically on reload.

pub mod fuzzy;
pub mod index;
pub mod normalize;
pub mod reference;
pub mod symbols;

pub use fuzzy::similarity;
pub use index::{CatalogCard, CatalogHandle, CatalogIndex};
pub use normalize::{canonical_key, normalize, normalize_collector_number};
pub use reference::{ReferenceRecord, ReferenceStore};
pub use symbols::{match_symbol, GrayImage, SetSymbol, SymbolMatch};
