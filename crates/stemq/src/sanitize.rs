use unicode_normalization::UnicodeNormalization;

/// Characters that survive sanitization (besides ASCII letters and digits)
const ALLOWED_PUNCTUATION: &[char] = &['_', '-', '.', ',', '[', ']', '(', ')'];

/// Convert arbitrary text into a clean file name component.
///
/// Diacritics are stripped (NFD, then non-ASCII dropped), the result is
/// lowercased, runs of whitespace collapse to a single `_`, and anything
/// outside `[a-z0-9_\-.,\[\]()]` is removed. Applying it twice gives the same
/// result as applying it once.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_whitespace = false;

    for c in input.trim().nfd().filter(char::is_ascii) {
        if c.is_ascii_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;

        let c = c.to_ascii_lowercase();
        if is_allowed(c) {
            out.push(c);
        }
    }

    out
}

/// Whether `c` may appear in a sanitized name
pub fn is_allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || ALLOWED_PUNCTUATION.contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strips_accents_and_lowercases() {
        assert_eq!(sanitize_filename("Beyoncé - Déjà Vu"), "beyonce_-_deja_vu");
        assert_eq!(sanitize_filename("Sigur Rós"), "sigur_ros");
    }

    #[test]
    fn test_collapses_whitespace_and_trims() {
        assert_eq!(sanitize_filename("  a \t\n b  "), "a_b");
    }

    #[test]
    fn test_drops_disallowed_characters() {
        assert_eq!(sanitize_filename("john's portrait in 2004.jpg"), "johns_portrait_in_2004.jpg");
        assert_eq!(sanitize_filename("AC/DC: Live!"), "acdc_live");
        assert_eq!(sanitize_filename("(256kbps_demo)"), "(256kbps_demo)");
        assert_eq!(sanitize_filename("mix [v2], final"), "mix_[v2],_final");
    }

    #[test]
    fn test_static_mix_name() {
        assert_eq!(
            sanitize_filename("Artist-Title_vocals_drums__256kbps_demo_"),
            "artist-title_vocals_drums__256kbps_demo_"
        );
    }

    #[test]
    fn test_non_latin_text_vanishes() {
        assert_eq!(sanitize_filename("東京"), "");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn sanitize_is_idempotent(input in any::<String>()) {
            let once = sanitize_filename(&input);
            prop_assert_eq!(sanitize_filename(&once), once);
        }

        #[test]
        fn sanitize_output_stays_in_alphabet(input in "\\PC*") {
            let sanitized = sanitize_filename(&input);
            for c in sanitized.chars() {
                prop_assert!(is_allowed(c), "unexpected {:?} in {:?}", c, sanitized);
            }
        }

        #[test]
        fn sanitize_never_emits_path_separators(input in "[a-zA-Z0-9 /\\\\:._-]{0,40}") {
            let sanitized = sanitize_filename(&input);
            prop_assert!(!sanitized.contains('/'));
            prop_assert!(!sanitized.contains('\\'));
        }
    }
}
