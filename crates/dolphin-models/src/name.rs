//! Student name normalization.
//!
//! Names arrive as free text. Before a name is spoken or drawn it is trimmed,
//! inner whitespace is collapsed and control characters are dropped. Arabic
//! names additionally lose their harakat and tatweel so the shaped text
//! stays legible at display size.

/// Arabic harakat (fathatan through sukun).
const ARABIC_DIACRITICS: std::ops::RangeInclusive<char> = '\u{064B}'..='\u{0652}';

/// Arabic tatweel (kashida).
const TATWEEL: char = '\u{0640}';

/// Collapse runs of whitespace into single spaces and trim the ends.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// General normalization: drop control characters, collapse whitespace.
pub fn normalize_name(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    collapse_whitespace(&cleaned)
}

/// [`normalize_name`] plus removal of Arabic diacritics and tatweel.
/// Every other character is kept as written.
pub fn normalize_arabic_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !ARABIC_DIACRITICS.contains(c) && *c != TATWEEL)
        .collect();
    normalize_name(&cleaned)
}
