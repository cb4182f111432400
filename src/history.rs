use std::collections::{HashMap, VecDeque};

use crate::models::ItemId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub item_id: ItemId,
    /// Normalised expected answer text, if the item has one
    pub answer: Option<String>,
}

/// Trailing window of each learner's most recent attempts.
///
/// Each learner keeps at most `window` entries; recording into a full window
/// evicts the oldest one. Lookups scan a single window, so they cost
/// O(window) regardless of how long the attempt log grows.
#[derive(Debug, Clone)]
pub struct HistoryGuard {
    window: usize,
    recent: HashMap<String, VecDeque<HistoryEntry>>,
}

impl HistoryGuard {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn record(&mut self, learner_id: &str, item_id: ItemId, answer_text: Option<&str>) {
        let entries = self
            .recent
            .entry(learner_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window));

        if entries.len() == self.window {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            item_id,
            answer: answer_text.map(normalize_answer).filter(|a| !a.is_empty()),
        });
    }

    pub fn is_recently_served(&self, learner_id: &str, item_id: ItemId) -> bool {
        self.recent
            .get(learner_id)
            .is_some_and(|entries| entries.iter().any(|e| e.item_id == item_id))
    }

    pub fn is_recently_answered(&self, learner_id: &str, answer_text: &str) -> bool {
        let needle = normalize_answer(answer_text);
        if needle.is_empty() {
            return false;
        }
        self.recent.get(learner_id).is_some_and(|entries| {
            entries
                .iter()
                .any(|e| e.answer.as_deref() == Some(needle.as_str()))
        })
    }

    pub fn entries(&self, learner_id: &str) -> impl Iterator<Item = &HistoryEntry> {
        self.recent.get(learner_id).into_iter().flatten()
    }
}

pub fn normalize_answer(text: &str) -> String {
    text.trim().to_lowercase()
}
