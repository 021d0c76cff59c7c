//! Symbol normalization and quote-currency parsing.
//!
//! Venues spell the same instrument differently ("ETH-USDT", "eth_usdt",
//! "ETHUSDT"); the normalized form is the join key for the cross-venue
//! index. Quote suffixes are matched longest-first so FDUSD pairs are not
//! misread as USDT pairs.

use crate::models::QuoteCurrency;

/// Known quote suffixes in descending length. Order matters.
const QUOTE_SUFFIXES: &[(&str, QuoteCurrency)] = &[
    ("FDUSD", QuoteCurrency::Fdusd),
    ("USDT", QuoteCurrency::Usdt),
    ("USDC", QuoteCurrency::Usdc),
    ("USDE", QuoteCurrency::Usde),
];

/// Canonicalize a venue-native symbol: uppercase, separators stripped.
/// Idempotent.
pub fn normalize(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| !matches!(c, '-' | '/' | '_'))
        .collect::<String>()
        .to_uppercase()
}

/// Split a symbol into (base, quote). Falls back to USDT when no known
/// suffix matches, stripping a trailing "USDT" from the base if present.
pub fn parse_symbol(symbol: &str) -> (String, QuoteCurrency) {
    let normalized = normalize(symbol);

    for (suffix, quote) in QUOTE_SUFFIXES {
        if normalized.len() > suffix.len() && normalized.ends_with(suffix) {
            let base = normalized[..normalized.len() - suffix.len()].to_string();
            return (base, *quote);
        }
    }

    // Assume-USDT fallback for unrecognized spellings.
    let base = normalized
        .strip_suffix("USDT")
        .filter(|b| !b.is_empty())
        .unwrap_or(&normalized)
        .to_string();
    (base, QuoteCurrency::Usdt)
}

/// True when the symbol actually carries one of the known quote
/// suffixes, i.e. quote parsing will not hit the assume-USDT fallback.
/// Used to filter venue symbol universes down to supported instruments.
pub fn has_known_quote(symbol: &str) -> bool {
    let normalized = normalize(symbol);
    QUOTE_SUFFIXES
        .iter()
        .any(|(suffix, _)| normalized.len() > suffix.len() && normalized.ends_with(suffix))
}

/// Reshape to the standard USDT-quoted key used by the cross-venue index.
pub fn to_usdt_symbol(base: &str) -> String {
    format!("{base}USDT")
}

/// Cross-venue index key for an arbitrary venue-native symbol.
pub fn index_key(symbol: &str) -> String {
    let (base, _) = parse_symbol(symbol);
    to_usdt_symbol(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_separators_and_uppercases() {
        assert_eq!(normalize("eth-usdt"), "ETHUSDT");
        assert_eq!(normalize("ETH/USDT"), "ETHUSDT");
        assert_eq!(normalize("eth_usdt"), "ETHUSDT");
        assert_eq!(normalize("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for s in ["btc-usdt", "SOL_USDC", "fdusd/usdt", "weird-_/sym"] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_parse_symbol_longest_suffix_first() {
        // FDUSDUSDT must parse as FDUSD/USDT, not F/DUSDUSDT.
        assert_eq!(
            parse_symbol("FDUSDUSDT"),
            ("FDUSD".to_string(), QuoteCurrency::Usdt)
        );
        assert_eq!(
            parse_symbol("ETHFDUSD"),
            ("ETH".to_string(), QuoteCurrency::Fdusd)
        );
    }

    #[test]
    fn test_parse_symbol_known_quotes() {
        assert_eq!(
            parse_symbol("ETHUSDC"),
            ("ETH".to_string(), QuoteCurrency::Usdc)
        );
        assert_eq!(
            parse_symbol("BTCUSDE"),
            ("BTC".to_string(), QuoteCurrency::Usde)
        );
        assert_eq!(
            parse_symbol("sol-usdt"),
            ("SOL".to_string(), QuoteCurrency::Usdt)
        );
    }

    #[test]
    fn test_parse_symbol_fallback_assumes_usdt() {
        assert_eq!(
            parse_symbol("ETHBTC"),
            ("ETHBTC".to_string(), QuoteCurrency::Usdt)
        );
    }

    #[test]
    fn test_has_known_quote() {
        assert!(has_known_quote("ETHUSDT"));
        assert!(has_known_quote("ethfdusd"));
        assert!(!has_known_quote("ETHBTC"));
        // The bare quote currency itself is not a pair.
        assert!(!has_known_quote("USDT"));
    }

    #[test]
    fn test_index_key_reshapes_to_usdt() {
        assert_eq!(index_key("ETHUSDC"), "ETHUSDT");
        assert_eq!(index_key("eth-usdt"), "ETHUSDT");
        assert_eq!(index_key("SOLFDUSD"), "SOLUSDT");
    }
}
