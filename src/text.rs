use crate::language::fold_lowercase;
use crate::settings::{AppSettings, RegexFilter};
use natural::phonetics::soundex;
use regex::Regex;
use std::collections::HashMap;
use strsim::levenshtein;

/// Post-processes finalized transcripts: whitespace cleanup, learned word
/// corrections, user regex filters, casing and terminal punctuation.
///
/// `process` never fails; a bad filter is skipped with a warning and the
/// rest of the pipeline still runs.
pub struct TextProcessor {
    language: String,
    custom_words: Vec<String>,
    correction_threshold: f64,
    user_corrections: HashMap<String, String>,
    regex_filters: Vec<RegexFilter>,
    auto_capitalize: bool,
    auto_punctuation: bool,
}

impl TextProcessor {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            language: settings.language.clone(),
            custom_words: settings.custom_words.clone(),
            correction_threshold: settings.word_correction_threshold,
            user_corrections: HashMap::new(),
            regex_filters: settings.regex_filters.clone(),
            auto_capitalize: settings.auto_capitalize,
            auto_punctuation: settings.auto_punctuation,
        }
    }

    /// Attach corrections learned from the user's manual edits. These run
    /// after the fuzzy vocabulary pass, as exact word replacements.
    pub fn with_corrections(mut self, corrections: HashMap<String, String>) -> Self {
        self.user_corrections = corrections;
        self
    }

    pub fn process(&self, raw: &str) -> String {
        let mut text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return text;
        }

        text = apply_custom_words(&text, &self.custom_words, self.correction_threshold);
        if !self.user_corrections.is_empty() {
            text = crate::corrections::apply_user_corrections(&text, &self.user_corrections);
        }
        text = apply_regex_filters(&text, &self.regex_filters);

        if self.auto_capitalize {
            text = capitalize_first(&text, &self.language);
        }
        if self.auto_punctuation && !ends_with_terminal_punctuation(&text) {
            text.push('.');
        }
        text
    }
}

#[async_trait::async_trait]
impl crate::services::TextProcessing for TextProcessor {
    async fn process(&self, text: &str) -> anyhow::Result<String> {
        Ok(TextProcessor::process(self, text))
    }
}

/// Corrects words against the user's learned vocabulary using fuzzy matching:
/// Levenshtein distance normalized by length, with a soundex boost for words
/// that sound alike. A candidate is accepted when its combined score falls
/// below `threshold`.
pub fn apply_custom_words(text: &str, custom_words: &[String], threshold: f64) -> String {
    if custom_words.is_empty() {
        return text.to_string();
    }

    let custom_words_lower: Vec<String> =
        custom_words.iter().map(|w| fold_lowercase(w)).collect();

    let mut corrected_words = Vec::new();

    for word in text.split_whitespace() {
        let cleaned_word =
            fold_lowercase(word.trim_matches(|c: char| !c.is_alphabetic()));

        if cleaned_word.is_empty() {
            corrected_words.push(word.to_string());
            continue;
        }

        let cleaned_len = cleaned_word.chars().count();
        // Very long tokens are never dictation vocabulary.
        if cleaned_len > 50 {
            corrected_words.push(word.to_string());
            continue;
        }

        let mut best_match: Option<&String> = None;
        let mut best_score = f64::MAX;

        for (i, custom_word_lower) in custom_words_lower.iter().enumerate() {
            let custom_len = custom_word_lower.chars().count();
            if (cleaned_len as i32 - custom_len as i32).abs() > 5 {
                continue;
            }

            let levenshtein_dist = levenshtein(&cleaned_word, custom_word_lower);
            let max_len = cleaned_len.max(custom_len) as f64;
            let levenshtein_score = if max_len > 0.0 {
                levenshtein_dist as f64 / max_len
            } else {
                1.0
            };

            let phonetic_match = soundex(&cleaned_word, custom_word_lower);
            let combined_score = if phonetic_match {
                levenshtein_score * 0.3
            } else {
                levenshtein_score
            };

            if combined_score < threshold && combined_score < best_score {
                best_match = Some(&custom_words[i]);
                best_score = combined_score;
            }
        }

        if let Some(replacement) = best_match {
            let corrected = preserve_case_pattern(word, replacement);
            let (prefix, suffix) = extract_punctuation(word);
            corrected_words.push(format!("{}{}{}", prefix, corrected, suffix));
        } else {
            corrected_words.push(word.to_string());
        }
    }

    corrected_words.join(" ")
}

fn preserve_case_pattern(original: &str, replacement: &str) -> String {
    if original.chars().all(|c| c.is_uppercase()) {
        replacement.to_uppercase()
    } else if original.chars().next().map_or(false, |c| c.is_uppercase()) {
        let mut chars: Vec<char> = replacement.chars().collect();
        if let Some(first_char) = chars.get_mut(0) {
            *first_char = first_char.to_uppercase().next().unwrap_or(*first_char);
        }
        chars.into_iter().collect()
    } else {
        replacement.to_string()
    }
}

fn extract_punctuation(word: &str) -> (&str, &str) {
    let prefix_end = word
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map_or(word.len(), |(i, _)| i);
    let suffix_start = word
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphabetic())
        .map_or(prefix_end, |(i, c)| i + c.len_utf8());

    (&word[..prefix_end], &word[suffix_start..])
}

/// Applies every enabled regex filter in order. Invalid patterns are
/// logged and skipped so one bad rule cannot break the pipeline.
pub fn apply_regex_filters(text: &str, regex_filters: &[RegexFilter]) -> String {
    let mut result = text.to_string();

    for filter in regex_filters {
        if !filter.enabled {
            continue;
        }

        match Regex::new(&filter.pattern) {
            Ok(regex) => {
                result = regex.replace_all(&result, filter.replacement.as_str()).to_string();
            }
            Err(e) => {
                log::warn!(
                    "Invalid regex pattern '{}' in filter '{}': {}",
                    filter.pattern,
                    filter.name,
                    e
                );
            }
        }
    }

    result
}

/// Uppercases the first letter with the language's casing rules, so a
/// Turkish transcript starting with "i" becomes "İ" rather than "I".
fn capitalize_first(text: &str, language: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => {
            let turkish = language.starts_with("tr");
            let upper: String = if turkish && first == 'i' {
                "İ".to_string()
            } else if turkish && first == 'ı' {
                "I".to_string()
            } else {
                first.to_uppercase().collect()
            };
            format!("{}{}", upper, chars.as_str())
        }
        None => String::new(),
    }
}

fn ends_with_terminal_punctuation(text: &str) -> bool {
    matches!(text.chars().last(), Some('.' | '!' | '?' | '…' | ':'))
}
