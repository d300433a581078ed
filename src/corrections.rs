//! Learned correction dictionary.
//!
//! When the user edits a finished transcript, the word-level diff between
//! the raw and edited text is mined for recurring fixes. A fix that shows
//! up often enough is applied automatically to future transcripts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use strsim::levenshtein;

/// Confirmations required before a learned fix is applied automatically.
const MIN_CONFIRMATIONS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCorrection {
    pub wrong: String,
    pub right: String,
    pub count: u32,
    /// Unix epoch milliseconds of the most recent confirmation.
    pub last_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorrectionStore {
    pub corrections: Vec<UserCorrection>,
    #[serde(default)]
    pub version: u32,
}

impl CorrectionStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read corrections file {:?}", path.as_ref()))?;
        serde_json::from_str(&raw).context("failed to parse corrections file")
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("failed to write corrections file {:?}", path.as_ref()))
    }

    /// Record one wrong→right pair. Repeats bump the counter; identity
    /// pairs are dropped as noise.
    pub fn add(&mut self, wrong: &str, right: &str, now_ms: u64) {
        let lower_wrong = wrong.to_lowercase();
        if lower_wrong == right.to_lowercase() {
            return;
        }

        if let Some(existing) = self
            .corrections
            .iter_mut()
            .find(|c| c.wrong.to_lowercase() == lower_wrong)
        {
            existing.right = right.to_string();
            existing.count += 1;
            existing.last_seen = now_ms;
        } else {
            self.corrections.push(UserCorrection {
                wrong: lower_wrong,
                right: right.to_string(),
                count: 1,
                last_seen: now_ms,
            });
        }
    }

    pub fn remove(&mut self, wrong: &str) -> bool {
        let lower_wrong = wrong.to_lowercase();
        let before = self.corrections.len();
        self.corrections
            .retain(|c| c.wrong.to_lowercase() != lower_wrong);
        self.corrections.len() < before
    }

    /// Mine a user edit for corrections and fold them into the store.
    pub fn learn_from_edit(&mut self, original: &str, edited: &str, now_ms: u64) -> usize {
        let pairs = learn_from_diff(original, edited);
        let learned = pairs.len();
        for (wrong, right) in pairs {
            self.add(&wrong, &right, now_ms);
        }
        learned
    }

    /// Corrections confirmed often enough to apply without asking.
    pub fn active_map(&self) -> HashMap<String, String> {
        self.corrections
            .iter()
            .filter(|c| c.count >= MIN_CONFIRMATIONS)
            .filter(|c| c.wrong.to_lowercase() != c.right.to_lowercase())
            .map(|c| (c.wrong.clone(), c.right.clone()))
            .collect()
    }
}

/// Word-level diff between a raw transcript and its edited form. Pairs with
/// a Levenshtein distance of 1 or 2 count as corrections; bigger rewrites
/// are treated as rephrasing and ignored. Stopwords are skipped because
/// their edits are almost never recognizer mistakes.
pub fn learn_from_diff(original: &str, edited: &str) -> Vec<(String, String)> {
    let orig_words: Vec<&str> = original.split_whitespace().collect();
    let edit_words: Vec<&str> = edited.split_whitespace().collect();

    let mut learned = Vec::new();
    let mut consider = |ol: String, el: String| {
        if ol == el || ol.chars().count() < 3 {
            return;
        }
        if is_turkish_stopword(&ol) || is_turkish_stopword(&el) {
            return;
        }
        let dist = levenshtein(&ol, &el);
        if dist > 0 && dist <= 2 {
            learned.push((ol, el));
        }
    };

    if orig_words.len() == edit_words.len() {
        for (o, e) in orig_words.iter().zip(edit_words.iter()) {
            consider(o.to_lowercase(), e.to_lowercase());
        }
    } else {
        for (o, e) in align_words(&orig_words, &edit_words) {
            if let (Some(orig_w), Some(edit_w)) = (o, e) {
                consider(orig_w.to_lowercase(), edit_w.to_lowercase());
            }
        }
    }

    learned
}

pub fn is_turkish_stopword(word: &str) -> bool {
    const STOPWORDS: &[&str] = &[
        "ve", "bir", "ile", "ben", "sen", "biz", "siz", "bu", "su", "o",
        "da", "de", "mi", "mu", "mü", "ki", "ama", "var", "yok", "ne",
        "hem", "her", "ise", "icin", "gibi", "kadar", "daha", "en",
        "cok", "az", "tam", "tum", "hep", "hic", "sey", "diye",
        "bana", "sana", "ona", "beni", "seni", "onu",
        "oldu", "olan", "olur", "etti", "eden", "eder",
        "dedi", "diyor", "der", "geldi", "gitti",
        "bunu", "sunu", "neden", "nasil", "nere",
    ];
    STOPWORDS.contains(&word)
}

/// Align two word sequences of different length with an LCS table so that
/// substituted words pair up and insertions/deletions pair with nothing.
fn align_words<'a>(
    orig: &[&'a str],
    edit: &[&'a str],
) -> Vec<(Option<String>, Option<String>)> {
    let m = orig.len();
    let n = edit.len();
    let mut dp = vec![vec![0u32; n + 1]; m + 1];

    for i in 1..=m {
        for j in 1..=n {
            if orig[i - 1].to_lowercase() == edit[j - 1].to_lowercase() {
                dp[i][j] = dp[i - 1][j - 1] + 1;
            } else {
                dp[i][j] = dp[i - 1][j].max(dp[i][j - 1]);
            }
        }
    }

    let mut result = Vec::new();
    let mut i = m;
    let mut j = n;

    while i > 0 || j > 0 {
        if i > 0 && j > 0 && orig[i - 1].to_lowercase() == edit[j - 1].to_lowercase() {
            result.push((Some(orig[i - 1].to_string()), Some(edit[j - 1].to_string())));
            i -= 1;
            j -= 1;
        } else if i > 0 && j > 0 && dp[i - 1][j - 1] >= dp[i - 1][j] && dp[i - 1][j - 1] >= dp[i][j - 1]
        {
            result.push((Some(orig[i - 1].to_string()), Some(edit[j - 1].to_string())));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || dp[i][j - 1] >= dp[i - 1][j]) {
            result.push((None, Some(edit[j - 1].to_string())));
            j -= 1;
        } else {
            result.push((Some(orig[i - 1].to_string()), None));
            i -= 1;
        }
    }

    result.reverse();
    result
}

/// Apply learned corrections with whole-word matching. Longer keys run
/// first so overlapping corrections resolve deterministically.
pub fn apply_user_corrections(text: &str, corrections: &HashMap<String, String>) -> String {
    if corrections.is_empty() {
        return text.to_string();
    }

    let mut sorted: Vec<(&String, &String)> = corrections.iter().collect();
    sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut result = text.to_string();
    for (wrong, right) in sorted {
        result = replace_whole_word_unicode(&result, wrong, right);
    }
    result
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphabetic() || ch == '\'' || ch == '\u{2019}'
}

fn replace_whole_word_unicode(text: &str, word: &str, replacement: &str) -> String {
    let mut result = String::new();
    let text_lower = text.to_lowercase();
    let word_lower = word.to_lowercase();
    let mut last_end = 0;

    for (idx, _) in text_lower.match_indices(&word_lower) {
        // Indices come from the lowercased text; only use them when they
        // land on char boundaries of the original (lowercasing can change
        // byte length, e.g. İ).
        if idx < last_end || !text.is_char_boundary(idx) {
            continue;
        }
        let before_ok = idx == 0 || {
            let prev_char = text[..idx].chars().last().unwrap_or(' ');
            !is_word_char(prev_char)
        };
        let after_idx = idx + word_lower.len();
        if after_idx > text.len() || !text.is_char_boundary(after_idx) {
            continue;
        }
        let after_ok = after_idx >= text.len() || {
            let next_char = text[after_idx..].chars().next().unwrap_or(' ');
            !is_word_char(next_char)
        };

        if before_ok && after_ok {
            result.push_str(&text[last_end..idx]);
            let starts_upper = text[idx..]
                .chars()
                .next()
                .map_or(false, |c| c.is_uppercase());
            if starts_upper {
                let mut chars = replacement.chars();
                if let Some(first) = chars.next() {
                    result.push(first.to_uppercase().next().unwrap_or(first));
                    result.extend(chars);
                }
            } else {
                result.push_str(replacement);
            }
            last_end = after_idx;
        }
    }

    result.push_str(&text[last_end..]);
    result
}
