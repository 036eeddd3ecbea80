//! Normalisation of raw text pulled out of EDSP pages.
//!
//! The portal renders "no data" as a dash, and uses Brazilian number
//! formatting (`5,23` for decimals, `1.234` for thousands).

fn is_placeholder(s: &str) -> bool {
    matches!(s, "" | "-" | "—" | "–" | "N/A" | "n/a" | "--")
}

/// Collapse internal whitespace and trim. `"  Escola\n  Estadual "` → `"Escola Estadual"`
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Like [`clean_text`] but placeholder dashes become empty.
pub fn clean_field(s: &str) -> String {
    let s = clean_text(s);
    if is_placeholder(&s) { String::new() } else { s }
}

/// Parse a score: `"5,23"` → 5.23 | `"5.23"` → 5.23 | `"-"` → None
pub fn parse_score(s: &str) -> Option<f64> {
    let s = s.trim();
    if is_placeholder(s) {
        return None;
    }
    let normalised = if s.contains(',') {
        s.replace('.', "").replace(',', ".")
    } else {
        s.to_string()
    };
    let cleaned: String = normalised
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

/// Parse a count, ignoring thousands separators.
/// `"1.234"` → 1234 | `"0"` → 0 | `"-"` → None
pub fn parse_count(s: &str) -> Option<u32> {
    let s = s.trim();
    if is_placeholder(s) {
        return None;
    }
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Text following `label` in a `"Label: value"` paragraph.
pub fn value_after_label(text: &str, label: &str) -> Option<String> {
    let (_, rest) = text.split_once(label)?;
    let value = clean_field(rest);
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("5,23"), Some(5.23));
        assert_eq!(parse_score("4.7"), Some(4.7));
        assert_eq!(parse_score(" 0 "), Some(0.0));
        assert_eq!(parse_score("-"), None);
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("sem nota"), None);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("1.234"), Some(1234));
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("0"), Some(0));
        assert_eq!(parse_count("—"), None);
        assert_eq!(parse_count("N/A"), None);
    }

    #[test]
    fn test_value_after_label() {
        assert_eq!(
            value_after_label("Bairro:  Vila  Mariana ", "Bairro:"),
            Some("Vila Mariana".to_string())
        );
        assert_eq!(value_after_label("Bairro: -", "Bairro:"), None);
        assert_eq!(value_after_label("Município: Santos", "Bairro:"), None);
    }
}
