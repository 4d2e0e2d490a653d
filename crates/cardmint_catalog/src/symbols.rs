//! Set-symbol matching signal.
//!
//! Each known set ships a normalized 128x128 grayscale icon with a
//! precomputed SHA-256. When a capture provides a symbol crop, normalized
//! cross-correlation at fixed scales produces a (set_id, score) signal for
//! the resolver. This is an input signal only, never a standalone decision.

use cardmint_protocol::defaults::{SYMBOL_MATCH_SCALES, SYMBOL_MATCH_THRESHOLD};
use sha2::{Digest, Sha256};

/// Normalized icon edge length.
pub const SYMBOL_EDGE: usize = 128;

/// Grayscale pixel buffer, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Option<GrayImage> {
        (pixels.len() == width * height).then_some(GrayImage {
            width,
            height,
            pixels,
        })
    }

    fn at(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    /// Nearest-neighbor resample to the given edge length.
    fn resample(&self, edge: usize) -> GrayImage {
        let mut pixels = Vec::with_capacity(edge * edge);
        for y in 0..edge {
            for x in 0..edge {
                let src_x = (x * self.width) / edge;
                let src_y = (y * self.height) / edge;
                pixels.push(self.at(src_x.min(self.width - 1), src_y.min(self.height - 1)));
            }
        }
        GrayImage {
            width: edge,
            height: edge,
            pixels,
        }
    }

    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.pixels);
        hex::encode(hasher.finalize())
    }
}

/// One known set icon.
#[derive(Debug, Clone)]
pub struct SetSymbol {
    pub set_id: String,
    /// Digest of the normalized 128x128 pixels; verified at load time.
    pub sha256: String,
    pub icon: GrayImage,
}

impl SetSymbol {
    /// Build a symbol and verify its precomputed digest.
    pub fn new(set_id: impl Into<String>, sha256: impl Into<String>, icon: GrayImage) -> Option<SetSymbol> {
        let sha256 = sha256.into();
        if icon.width != SYMBOL_EDGE || icon.height != SYMBOL_EDGE || icon.sha256() != sha256 {
            return None;
        }
        Some(SetSymbol {
            set_id: set_id.into(),
            sha256,
            icon,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMatch {
    pub set_id: String,
    pub score: f64,
    pub scale: f64,
}

/// Best normalized cross-correlation between a symbol crop and the known
/// icons, tried at each fixed scale. Returns None below the threshold.
pub fn match_symbol(crop: &GrayImage, symbols: &[SetSymbol]) -> Option<SymbolMatch> {
    if crop.width == 0 || crop.height == 0 {
        return None;
    }

    let mut best: Option<SymbolMatch> = None;
    for symbol in symbols {
        for scale in SYMBOL_MATCH_SCALES {
            let edge = ((SYMBOL_EDGE as f64) * scale).round() as usize;
            let template = symbol.icon.resample(edge);
            let resized_crop = crop.resample(edge);
            let score = ncc(&resized_crop.pixels, &template.pixels);
            let better = best
                .as_ref()
                .map(|prev| score > prev.score)
                .unwrap_or(true);
            if score >= SYMBOL_MATCH_THRESHOLD && better {
                best = Some(SymbolMatch {
                    set_id: symbol.set_id.clone(),
                    score,
                    scale,
                });
            }
        }
    }
    best
}

/// Normalized cross-correlation of two equal-length buffers, in [-1, 1].
fn ncc(a: &[u8], b: &[u8]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&pa, &pb) in a.iter().zip(b) {
        let da = pa as f64 - mean_a;
        let db = pb as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        // Flat patches carry no structure to correlate.
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
