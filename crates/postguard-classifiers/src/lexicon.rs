//! Lexicon-based sentiment scorer
//!
//! Bundled as the `builtin:lexicon` artifact so the pipeline can run without
//! downloaded weights. It reports the same three classes as the production
//! sentiment model (`positive`, `neutral`, `negative`).

use crate::scorer::Scorer;
use aho_corasick::{AhoCorasick, MatchKind};
use postguard_core::{LoadError, ScoreError};

const POSITIVE: &[&str] = &[
    "good",
    "great",
    "excellent",
    "love",
    "amazing",
    "wonderful",
    "happy",
    "fantastic",
    "awesome",
    "best",
    "bagus",
    "suka",
    "senang",
    "hebat",
];

const NEGATIVE: &[&str] = &[
    "bad",
    "terrible",
    "awful",
    "hate",
    "horrible",
    "worst",
    "stupid",
    "angry",
    "disgusting",
    "idiot",
    "buruk",
    "benci",
    "jelek",
    "bodoh",
];

pub struct LexiconScorer {
    name: String,
    labels: Vec<String>,
    positive: AhoCorasick,
    negative: AhoCorasick,
    max_words: usize,
}

impl LexiconScorer {
    /// Build the scorer; only the first `max_words` words of a text are read
    pub fn new(max_words: usize) -> Result<Self, LoadError> {
        let positive = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(POSITIVE)
            .map_err(|e| {
                LoadError::invalid(format!("Failed to build positive sentiment matcher: {e}"))
            })?;

        let negative = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(NEGATIVE)
            .map_err(|e| {
                LoadError::invalid(format!("Failed to build negative sentiment matcher: {e}"))
            })?;

        Ok(Self {
            name: "sentiment-lexicon".to_string(),
            labels: vec![
                "positive".to_string(),
                "neutral".to_string(),
                "negative".to_string(),
            ],
            positive,
            negative,
            max_words,
        })
    }
}

impl Scorer for LexiconScorer {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn probabilities(&self, text: &str) -> Result<Vec<f32>, ScoreError> {
        let text = truncate_words(text, self.max_words);

        let positive_hits = whole_word_hits(&self.positive, text) as f32;
        let negative_hits = whole_word_hits(&self.negative, text) as f32;
        let total = positive_hits + negative_hits;

        // No sentiment words at all is zero signal.
        if total == 0.0 {
            return Ok(vec![0.0, 1.0, 0.0]);
        }

        Ok(vec![positive_hits / total, 0.0, negative_hits / total])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Count matches that are whole words, so `hate` does not fire inside `whatever`
fn whole_word_hits(matcher: &AhoCorasick, text: &str) -> usize {
    matcher
        .find_iter(text)
        .filter(|m| {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .count()
}

fn truncate_words(text: &str, max_words: usize) -> &str {
    let mut count = 0;
    let mut in_word = false;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            count += 1;
            if count > max_words {
                return &text[..idx];
            }
        }
    }

    text
}
