//! Derived keyword tags
//!
//! The store only depends on the [`Tagger`] trait; [`KeywordTagger`] is the
//! built-in frequency-based extractor.

use super::types::HistoryItem;
use regex::Regex;
use std::collections::HashMap;

/// Derives `aiTags` for an item
pub trait Tagger: Send + Sync {
    fn tags(&self, item: &HistoryItem) -> crate::Result<Vec<String>>;
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "before", "being", "could", "does", "each",
    "from", "have", "here", "into", "just", "like", "more", "most", "only", "other", "over",
    "same", "should", "some", "such", "than", "that", "their", "them", "then", "there",
    "these", "they", "this", "those", "very", "were", "what", "when", "where", "which",
    "while", "will", "with", "would", "your",
];

const WORD_PATTERN: &str = r"[a-z0-9]+";

/// Frequency-ranked keywords plus the item's type and platform
#[derive(Debug, Clone)]
pub struct KeywordTagger {
    word: Regex,
    max_keywords: usize,
    min_word_len: usize,
}

impl KeywordTagger {
    pub fn new(max_keywords: usize) -> crate::Result<Self> {
        let word = Regex::new(WORD_PATTERN)
            .map_err(|e| crate::Error::Tagging(format!("Invalid word pattern: {}", e)))?;
        Ok(Self {
            word,
            max_keywords,
            min_word_len: 4,
        })
    }
}

impl Tagger for KeywordTagger {
    fn tags(&self, item: &HistoryItem) -> crate::Result<Vec<String>> {
        let text = format!("{} {}", item.title, item.content).to_lowercase();

        // word -> (count, first position)
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (pos, m) in self.word.find_iter(&text).enumerate() {
            let word = m.as_str();
            if word.len() < self.min_word_len
                || STOP_WORDS.contains(&word)
                || word.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            counts.entry(word).or_insert((0, pos)).0 += 1;
        }

        let mut ranked: Vec<(&str, usize, usize)> =
            counts.into_iter().map(|(w, (n, pos))| (w, n, pos)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut tags: Vec<String> = ranked
            .into_iter()
            .take(self.max_keywords)
            .map(|(w, _, _)| w.to_string())
            .collect();

        for extra in [item.content_type.to_string(), item.platform.to_lowercase()] {
            if !extra.is_empty() && !tags.contains(&extra) {
                tags.push(extra);
            }
        }

        Ok(tags)
    }
}
