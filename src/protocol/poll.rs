//! Long-poll body units.
//!
//! Engine.io v4 packs several packets into one polling body separated by the
//! ASCII record separator (`0x1e`). Units are forwarded one by one in body
//! order.

/// Packet delimiter inside a polling body.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Splits a polling body into its ordered, non-empty units.
#[must_use]
pub fn split_units(body: &str) -> Vec<&str> {
    body.split(RECORD_SEPARATOR)
        .filter(|unit| !unit.is_empty())
        .collect()
}

/// Joins units back into a polling body without a trailing separator.
#[must_use]
pub fn join_units<S: AsRef<str>>(units: &[S]) -> String {
    let mut body = String::new();
    for unit in units {
        body.push_str(unit.as_ref());
        body.push(RECORD_SEPARATOR);
    }
    while body.ends_with(RECORD_SEPARATOR) {
        body.pop();
    }
    body
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_split_multi_packet_body() {
        let body = "42[\"a\"]\u{1e}42[\"b\"]\u{1e}2";
        assert_eq!(split_units(body), vec!["42[\"a\"]", "42[\"b\"]", "2"]);
    }

    #[test]
    fn test_split_keeps_multibyte_content_whole() {
        let body = "42[\"héllo ✓\"]\u{1e}42[\"日本\"]";
        assert_eq!(split_units(body), vec!["42[\"héllo ✓\"]", "42[\"日本\"]"]);
    }

    #[test]
    fn test_split_skips_empty_units() {
        assert!(split_units("").is_empty());
        assert_eq!(split_units("\u{1e}6\u{1e}\u{1e}"), vec!["6"]);
    }

    #[test]
    fn test_join_trims_trailing_separators() {
        assert_eq!(join_units(&["a", "b", ""]), "a\u{1e}b");
        assert_eq!(join_units::<&str>(&[]), "");
    }

    proptest! {
        #[test]
        fn prop_n_units_split_in_order(units in prop::collection::vec("[^\u{1e}]{1,16}", 0..12)) {
            let body = join_units(&units);
            let split = split_units(&body);
            prop_assert_eq!(split.len(), units.len());
            for (got, want) in split.iter().zip(units.iter()) {
                prop_assert_eq!(*got, want.as_str());
            }
        }
    }
}
