//! Text normalization and token-boundary phrase matching.
//!
//! Every comparison between question text and policy vocabulary goes through
//! this module so that both sides are folded the same way:
//!
//! 1. Unicode compatibility decomposition (NFKD);
//! 2. combining marks dropped (`é` → `e`, Arabic harakat removed);
//! 3. control and zero-width characters dropped;
//! 4. lowercase;
//! 5. split into runs of letters/digits.
//!
//! Matching is done on whole tokens, never on substrings, so `nike` can not
//! match inside `unlikely`.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static TOKEN_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").ok());

/// Folds case, accents and invisible characters out of `raw`.
#[must_use]
pub fn fold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.nfkd() {
        if ch.is_control() || is_combining_mark(ch) {
            continue;
        }
        for lc in ch.to_lowercase() {
            match lc {
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => {}
                _ => out.push(lc),
            }
        }
    }
    out
}

/// Splits already-folded text into letter/digit tokens.
fn split_tokens(folded: &str) -> Vec<String> {
    match TOKEN_RE.as_ref() {
        Some(re) => re.find_iter(folded).map(|m| m.as_str().to_string()).collect(),
        // Unreachable with a valid pattern; keep a plain fallback rather than panic.
        None => folded
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// Normalizes `raw` into a token list.
#[must_use]
pub fn tokenize(raw: &str) -> Vec<String> {
    split_tokens(&fold(raw))
}

/// Strips one trailing `s` from tokens longer than three characters.
///
/// Enough to fold `drones`/`drone` and `fakes`/`fake` without a stemmer.
#[must_use]
pub fn singular(token: &str) -> &str {
    if token.chars().count() > 3 {
        if let Some(stripped) = token.strip_suffix('s') {
            return stripped;
        }
    }
    token
}

/// Token equality modulo plural folding.
#[must_use]
pub fn token_eq(a: &str, b: &str) -> bool {
    a == b || singular(a) == singular(b)
}

/// A normalized multi-token phrase taken from a policy cell or lexicon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phrase {
    /// Folded tokens joined by single spaces; stable lookup key.
    pub key: String,
    /// Folded tokens.
    pub tokens: Vec<String>,
}

impl Phrase {
    /// Builds a phrase from raw text. Returns `None` when nothing survives folding.
    #[must_use]
    pub fn new(raw: &str) -> Option<Self> {
        let tokens = tokenize(raw);
        if tokens.is_empty() {
            return None;
        }
        Some(Self {
            key: tokens.join(" "),
            tokens,
        })
    }

    /// `true` if the phrase occurs as a contiguous token run in `haystack`.
    #[must_use]
    pub fn occurs_in(&self, haystack: &[String]) -> bool {
        let n = self.tokens.len();
        if n == 0 || haystack.len() < n {
            return false;
        }
        haystack.windows(n).any(|window| {
            window
                .iter()
                .zip(&self.tokens)
                .all(|(h, p)| token_eq(h, p))
        })
    }
}

/// Question text after normalization.
///
/// `key` is what the response cache fingerprints, so two questions that
/// differ only in case, accents or punctuation share cache entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedText {
    /// Folded tokens in original order.
    pub tokens: Vec<String>,
    /// Tokens joined by single spaces.
    pub key: String,
}

impl NormalizedText {
    /// Normalizes raw question text.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        let tokens = tokenize(raw);
        let key = tokens.join(" ");
        Self { tokens, key }
    }

    /// `true` when nothing but punctuation/whitespace was supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Shorthand for [`Phrase::occurs_in`] over these tokens.
    #[must_use]
    pub fn contains(&self, phrase: &Phrase) -> bool {
        phrase.occurs_in(&self.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_removes_case_and_accents() {
        assert_eq!(fold("Côte d'Ivoire"), "cote d'ivoire");
        assert_eq!(fold("NIKE\u{200B}"), "nike");
    }

    #[test]
    fn tokenize_splits_on_punctuation() {
        assert_eq!(tokenize("Coca-Cola, in Nigeria?"), vec!["coca", "cola", "in", "nigeria"]);
        assert!(tokenize("  ?!  ").is_empty());
    }

    #[test]
    fn phrase_matching_respects_token_boundaries() {
        let nike = Phrase::new("Nike").expect("phrase");
        assert!(NormalizedText::new("Can I sell Nike shoes?").contains(&nike));
        assert!(!NormalizedText::new("That seems unlikely").contains(&nike));
    }

    #[test]
    fn multi_token_phrase_must_be_contiguous() {
        let nb = Phrase::new("new balance").expect("phrase");
        assert!(NormalizedText::new("selling New Balance sneakers").contains(&nb));
        assert!(!NormalizedText::new("new shoes with balance").contains(&nb));
    }

    #[test]
    fn plural_folding() {
        let drone = Phrase::new("drone").expect("phrase");
        assert!(NormalizedText::new("can i sell drones").contains(&drone));
        assert_eq!(singular("gas"), "gas");
        assert!(token_eq("fakes", "fake"));
    }
}
