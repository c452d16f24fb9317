//! Security domain adaptation of embedding inputs

use std::borrow::Cow;

/// Checked in order; the first keyword found in the text picks the prefix
const DOMAIN_PREFIXES: &[(&str, &str)] = &[
    ("vulnerability", "security vulnerability: "),
    ("malware", "malware analysis: "),
    ("threat", "threat intelligence: "),
    ("attack", "attack technique: "),
    ("research", "security research: "),
];

const GENERIC_TERMS: &[&str] = &["security", "cyber", "hack", "breach"];
const GENERIC_PREFIX: &str = "cybersecurity context: ";

/// Prefix `text` with a security context chosen by keyword.
///
/// Text without any security vocabulary (and empty text) is returned as is.
pub fn adapt_for_domain(text: &str) -> Cow<'_, str> {
    if text.is_empty() {
        return Cow::Borrowed(text);
    }

    let lower = text.to_lowercase();

    let prefix = DOMAIN_PREFIXES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, prefix)| *prefix)
        .or_else(|| {
            GENERIC_TERMS
                .iter()
                .any(|term| lower.contains(term))
                .then_some(GENERIC_PREFIX)
        });

    match prefix {
        Some(prefix) => Cow::Owned(format!("{}{}", prefix, text)),
        None => Cow::Borrowed(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_domain_wins() {
        assert_eq!(
            adapt_for_domain("Malware exploiting a Vulnerability"),
            "security vulnerability: Malware exploiting a Vulnerability"
        );
        assert_eq!(
            adapt_for_domain("new attack chain"),
            "attack technique: new attack chain"
        );
    }

    #[test]
    fn test_generic_security_terms() {
        assert_eq!(
            adapt_for_domain("data breach at vendor"),
            "cybersecurity context: data breach at vendor"
        );
    }

    #[test]
    fn test_unrelated_text_untouched() {
        assert!(matches!(adapt_for_domain("gardening tips"), Cow::Borrowed(_)));
        assert_eq!(adapt_for_domain(""), "");
    }
}
