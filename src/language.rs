use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Short language codes mapped to the full BCP-47 tags the recognition
/// backends expect.
static LOCALE_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("tr", "tr-TR"),
        ("en", "en-US"),
        ("de", "de-DE"),
        ("fr", "fr-FR"),
        ("es", "es-ES"),
        ("it", "it-IT"),
        ("pt", "pt-BR"),
        ("ru", "ru-RU"),
        ("ja", "ja-JP"),
        ("zh", "zh-CN"),
    ])
});

/// Characters that distinguish a language from its ASCII transliteration.
/// Recognition backends are biased toward ASCII output, so candidates
/// containing these score higher during alternative selection.
static SPECIAL_CHARS: Lazy<HashMap<&'static str, &'static [char]>> = Lazy::new(|| {
    HashMap::from([
        (
            "tr",
            &['ç', 'ğ', 'ı', 'ö', 'ş', 'ü', 'Ç', 'Ğ', 'İ', 'Ö', 'Ş', 'Ü'][..],
        ),
        ("de", &['ä', 'ö', 'ü', 'ß', 'Ä', 'Ö', 'Ü'][..]),
        (
            "fr",
            &['é', 'è', 'ê', 'ë', 'à', 'â', 'ç', 'î', 'ï', 'ô', 'û', 'ù', 'œ'][..],
        ),
        ("es", &['á', 'é', 'í', 'ó', 'ú', 'ñ', 'ü', '¿', '¡'][..]),
        (
            "pt",
            &['ã', 'õ', 'á', 'â', 'à', 'ç', 'é', 'ê', 'í', 'ó', 'ô', 'ú'][..],
        ),
    ])
});

/// Normalize a language code to a BCP-47 locale tag.
///
/// Already-qualified tags ("tr-TR") pass through unchanged; known short
/// codes use the table; anything else doubles the code ("nl" -> "nl-NL").
pub fn to_bcp47(language: &str) -> String {
    let trimmed = language.trim();
    if trimmed.contains('-') {
        return trimmed.to_string();
    }
    let lower = trimmed.to_lowercase();
    if let Some(tag) = LOCALE_MAP.get(lower.as_str()) {
        return (*tag).to_string();
    }
    format!("{}-{}", lower, lower.to_uppercase())
}

/// Language-specific characters for a configured language, empty for
/// languages with no entry (scoring then degrades to word count only).
pub fn special_chars(language: &str) -> &'static [char] {
    let primary = language
        .split('-')
        .next()
        .unwrap_or(language)
        .to_lowercase();
    SPECIAL_CHARS.get(primary.as_str()).copied().unwrap_or(&[])
}

/// Tunable weights for ranking recognition alternatives. The exact
/// values are heuristic; they live in settings so deployments can adjust
/// them per language without a rebuild.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    #[serde(default = "default_confidence_weight")]
    pub confidence: f64,
    #[serde(default = "default_confidence_weight")]
    pub interim_confidence: f64,
    #[serde(default = "default_char_bonus")]
    pub char_bonus: f64,
    #[serde(default = "default_word_bonus")]
    pub word_bonus: f64,
}

fn default_confidence_weight() -> f64 {
    50.0
}

fn default_char_bonus() -> f64 {
    4.0
}

fn default_word_bonus() -> f64 {
    1.0
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            confidence: default_confidence_weight(),
            interim_confidence: default_confidence_weight(),
            char_bonus: default_char_bonus(),
            word_bonus: default_word_bonus(),
        }
    }
}

/// Score how strongly a candidate looks like real text in the configured
/// language: a bonus per language-specific character plus a bonus per word,
/// so longer and properly-spelled candidates beat ASCII transliterations.
pub fn signal_score(text: &str, chars: &[char], weights: &ScoringWeights) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let specials = text.chars().filter(|c| chars.contains(c)).count();
    let words = text.split_whitespace().count();
    weights.char_bonus * specials as f64 + weights.word_bonus * words as f64
}

/// Lowercase with Turkish dotted/dotless handling. `str::to_lowercase`
/// maps `İ` to `i` plus a combining dot, which never appears in recognizer
/// output and would defeat substring matching.
pub fn fold_lowercase(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'İ' => out.push('i'),
            'I' => out.push('ı'),
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_locale_mapping() {
        assert_eq!(to_bcp47("tr"), "tr-TR");
        assert_eq!(to_bcp47("en"), "en-US");
        assert_eq!(to_bcp47("pt"), "pt-BR");
    }

    #[test]
    fn test_qualified_tag_passes_through() {
        assert_eq!(to_bcp47("tr-TR"), "tr-TR");
        assert_eq!(to_bcp47("en-GB"), "en-GB");
    }

    #[test]
    fn test_unknown_code_doubles() {
        assert_eq!(to_bcp47("nl"), "nl-NL");
    }

    #[test]
    fn test_signal_score_rewards_diacritics_and_words() {
        let weights = ScoringWeights::default();
        let chars = special_chars("tr");
        // "çok" = one special char + one word
        assert_eq!(signal_score("çok", chars, &weights), 5.0);
        // ASCII transliteration only gets the word bonus
        assert_eq!(signal_score("cok", chars, &weights), 1.0);
        assert_eq!(signal_score("  ", chars, &weights), 0.0);
    }

    #[test]
    fn test_signal_score_counts_every_word() {
        let weights = ScoringWeights::default();
        let chars = special_chars("tr");
        assert_eq!(signal_score("bugün hava güzel", chars, &weights), 11.0);
    }

    #[test]
    fn test_fold_lowercase_turkish() {
        assert_eq!(fold_lowercase("FISILTI"), "fısıltı");
        assert_eq!(fold_lowercase("İstanbul"), "istanbul");
        assert_eq!(fold_lowercase("Test"), "test");
    }
}
