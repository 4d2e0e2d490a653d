//! Name and number normalization.
//!
//! Every lookup path funnels through `normalize` so that OCR output,
//! catalog rows and reference titles hash to the same canonical key.

/// Lowercase, fold confusable characters, strip punctuation, collapse
/// whitespace.
///
/// "Nidoran♀" -> "nidoran f", "Pokémon" -> "pokemon", "Mr. Mime" -> "mr mime".
pub fn normalize(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for ch in input.to_lowercase().chars() {
        match ch {
            'á' | 'à' | 'â' | 'ä' | 'ã' => folded.push('a'),
            'é' | 'è' | 'ê' | 'ë' => folded.push('e'),
            'í' | 'ì' | 'î' | 'ï' => folded.push('i'),
            'ó' | 'ò' | 'ô' | 'ö' | 'ō' | 'õ' => folded.push('o'),
            'ú' | 'ù' | 'û' | 'ü' | 'ū' => folded.push('u'),
            'ñ' => folded.push('n'),
            'ç' => folded.push('c'),
            '♀' => folded.push_str(" f"),
            '♂' => folded.push_str(" m"),
            '\u{2019}' | '\'' | '.' | ',' | '!' | '?' | ':' | '_' => {}
            ch if ch.is_ascii_alphanumeric() || ch == '-' || ch.is_whitespace() => {
                folded.push(ch)
            }
            // Everything else (box-drawing OCR noise, stray symbols) drops.
            _ => {}
        }
    }

    let repaired = repair_ocr_confusables(&folded);

    let mut out = String::with_capacity(repaired.len());
    let mut last_was_space = true;
    for ch in repaired.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Token-wise 0<->o and 1<->l repair.
///
/// A token that is mostly letters gets digits folded to letters; a token
/// that is mostly digits gets letters folded to digits. Mixed catalog codes
/// like "swsh045" stay untouched because the minority class never exceeds
/// the repair ratio.
fn repair_ocr_confusables(input: &str) -> String {
    input
        .split_whitespace()
        .map(repair_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn repair_token(token: &str) -> String {
    let letters = token.chars().filter(|c| c.is_ascii_alphabetic()).count();
    let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
    if letters == 0 && digits == 0 {
        return token.to_string();
    }

    if letters > digits * 3 {
        // Word-like: 0 -> o, 1 -> l.
        token
            .chars()
            .map(|c| match c {
                '0' => 'o',
                '1' => 'l',
                other => other,
            })
            .collect()
    } else if digits > letters * 3 {
        // Number-like: o -> 0, l/i -> 1.
        token
            .chars()
            .map(|c| match c {
                'o' => '0',
                'l' | 'i' => '1',
                other => other,
            })
            .collect()
    } else {
        token.to_string()
    }
}

/// Deterministic identifier for exact catalog lookup:
/// `normalized_set|normalized_number|normalized_name`.
pub fn canonical_key(set: &str, number: &str, name: &str) -> String {
    format!(
        "{}|{}|{}",
        normalize(set),
        normalize_collector_number(number),
        normalize(name)
    )
}

/// Normalize the collector portion of a set number for matching.
///
/// "063/102" -> "63"; the original string stays on the record untouched.
pub fn normalize_collector_number(number: &str) -> String {
    let collector = number.split('/').next().unwrap_or(number).trim();
    let digits: String = collector.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return normalize(collector);
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Printed total of a "NNN/TTT" set number, when present.
pub fn printed_total(number: &str) -> Option<u32> {
    let (_, total) = number.split_once('/')?;
    total.trim().parse().ok()
}
