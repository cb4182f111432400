//! Probabilistic band selection.
//!
//! A band is drawn from the configured near/explore/review probabilities, then
//! candidates are narrowed by topic and rating window. Empty windows widen
//! geometrically before falling back to any item in the topic, then any active
//! item at all. The random source is always passed in.

use rand::Rng;
use tracing::debug;

use crate::config::{SelectionConfig, MAX_WIDENINGS};
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::history::HistoryGuard;
use crate::models::{Band, Item, Learner, RecentAttempt, Selection, SelectionStage, TopicId, TopicStanding};

pub fn draw_band<R: Rng + ?Sized>(rng: &mut R, config: &SelectionConfig) -> Band {
    let u: f64 = rng.gen();
    if u < config.near_probability {
        Band::Near
    } else if u < config.near_probability + config.explore_probability {
        Band::Explore
    } else {
        Band::Review
    }
}

/// Inclusive rating window for `band`, with the tolerance doubled `widenings` times.
pub fn band_window(band: Band, reference: f64, widenings: u32, config: &SelectionConfig) -> (f64, f64) {
    let scale = 2f64.powi(widenings.min(MAX_WIDENINGS) as i32);
    let (centre, tolerance) = match band {
        Band::Near => (reference, config.near_tolerance),
        Band::Explore => (reference + config.explore_offset, config.offset_tolerance),
        Band::Review => (reference - config.review_offset, config.offset_tolerance),
    };
    let half = tolerance * scale;
    (centre - half, centre + half)
}

/// Topic the learner's last `max_streak` attempts were all in, if any.
pub fn streak_topic(recent: &[RecentAttempt], max_streak: usize) -> Option<TopicId> {
    if max_streak == 0 || recent.len() < max_streak {
        return None;
    }
    let tail = &recent[recent.len() - max_streak..];
    let topic = tail[0].topic_id;
    tail.iter().all(|r| r.topic_id == topic).then_some(topic)
}

/// Weakest topic first, then least recently practised (never practised wins),
/// then lowest id. A streaked topic is skipped when another is available.
pub fn choose_topic(
    standings: &[TopicStanding],
    streak: Option<TopicId>,
    default_rating: f64,
) -> Option<TopicId> {
    let others = standings.iter().filter(|s| Some(s.topic_id) != streak);
    let pool: Vec<&TopicStanding> = if others.clone().next().is_some() {
        others.collect()
    } else {
        standings.iter().collect()
    };

    pool.into_iter()
        .min_by(|a, b| {
            let ra = a.rating.unwrap_or(default_rating);
            let rb = b.rating.unwrap_or(default_rating);
            ra.total_cmp(&rb)
                .then_with(|| a.last_attempt_at.cmp(&b.last_attempt_at))
                .then_with(|| a.topic_id.cmp(&b.topic_id))
        })
        .map(|s| s.topic_id)
}

/// Per-request inputs to the policy.
pub struct SelectionContext<'a> {
    pub learner: &'a Learner,
    pub topic_hint: Option<TopicId>,
    /// Most recent attempts, oldest first
    pub recent: &'a [RecentAttempt],
    pub history: &'a HistoryGuard,
}

impl SelectionContext<'_> {
    fn is_recent(&self, item: &Item) -> bool {
        let learner = &self.learner.id;
        self.history.is_recently_served(learner, item.id)
            || item
                .answer_text
                .as_deref()
                .is_some_and(|answer| self.history.is_recently_answered(learner, answer))
    }
}

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    config: SelectionConfig,
    default_rating: f64,
}

impl SelectionPolicy {
    pub fn new(config: SelectionConfig, default_rating: f64) -> Self {
        Self {
            config,
            default_rating,
        }
    }

    pub fn select<R: Rng + ?Sized>(
        &self,
        db: &Database,
        ctx: &SelectionContext,
        rng: &mut R,
    ) -> Result<Selection> {
        let learner_id = ctx.learner.id.as_str();

        let topic = match ctx.topic_hint {
            Some(topic) => {
                if db.get_topic(topic)?.is_none() {
                    return Err(EngineError::invalid(format!("unknown topic {}", topic)));
                }
                Some(topic)
            }
            None => {
                let standings = db.topic_standings(learner_id)?;
                if standings.is_empty() {
                    return Err(EngineError::NoEligibleItems);
                }
                let streak = streak_topic(ctx.recent, self.config.max_topic_streak);
                choose_topic(&standings, streak, self.default_rating)
            }
        };

        let topic_rating = match topic {
            Some(topic) => db.get_topic_rating(learner_id, topic)?.map(|t| t.rating),
            None => None,
        };
        let reference = topic_rating
            .or(ctx.learner.rating)
            .unwrap_or(self.default_rating);

        let band = draw_band(rng, &self.config);
        debug!(learner = learner_id, ?topic, band = band.as_str(), reference, "drew selection band");

        let selected = |item: Item, stage: SelectionStage, recency_relaxed: bool| Selection {
            item_id: item.id,
            topic_id: item.topic_id,
            band,
            stage,
            reference_rating: reference,
            recency_relaxed,
        };

        // An empty targeted topic can only be served by the any-active fallback
        let topic_empty = match topic {
            Some(topic) => db.count_active_items(Some(topic))? == 0,
            None => false,
        };
        let widen_to = if topic_empty {
            None
        } else {
            Some(self.config.max_widenings.min(MAX_WIDENINGS))
        };

        for widenings in widen_to.into_iter().flat_map(|max| 0..=max) {
            let window = band_window(band, reference, widenings, &self.config);
            let candidates = db.candidate_items(topic, Some(window), self.default_rating)?;
            if let Some((item, relaxed)) = self.pick(candidates, ctx) {
                return Ok(selected(item, SelectionStage::Band { widenings }, relaxed));
            }
            debug!(learner = learner_id, widenings, lo = window.0, hi = window.1, "band window empty");
        }

        if topic.is_some() && widen_to.is_some() {
            let candidates = db.candidate_items(topic, None, self.default_rating)?;
            if let Some((item, relaxed)) = self.pick(candidates, ctx) {
                debug!(learner = learner_id, "fell back to any item in topic");
                return Ok(selected(item, SelectionStage::AnyInTopic, relaxed));
            }
        }

        let candidates = db.candidate_items(None, None, self.default_rating)?;
        if let Some((item, relaxed)) = self.pick(candidates, ctx) {
            debug!(learner = learner_id, "fell back to any active item");
            return Ok(selected(item, SelectionStage::AnyActive, relaxed));
        }

        Err(EngineError::NoEligibleItems)
    }

    // Candidates arrive ordered by (attempt_count, id), so the first survivor wins.
    fn pick(&self, candidates: Vec<Item>, ctx: &SelectionContext) -> Option<(Item, bool)> {
        if let Some(pos) = candidates.iter().position(|item| !ctx.is_recent(item)) {
            return candidates.into_iter().nth(pos).map(|item| (item, false));
        }
        if self.config.relax_recency {
            return candidates.into_iter().next().map(|item| (item, true));
        }
        None
    }
}
