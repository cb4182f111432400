//! Guess-corrected Elo update.
//!
//! A correct answer on a multiple-choice item is partly luck, so the raw 0/1
//! outcome is rescaled to remove the credit a random guess would earn before it
//! is compared with the logistic expectation. Learner and item move in opposite
//! directions; items move `item_k_divisor` times slower. Step sizes scale with
//! rating deviation, so entities with little evidence move fastest.
//!
//! Everything here is a pure function of its inputs.

use chrono::{DateTime, Utc};

use crate::config::{RatingConfig, MAX_RT_MULTIPLIER, MIN_RT_MULTIPLIER};
use crate::models::{RatingChange, RatingState};

/// Probability of a correct guess with `num_options` choices.
pub fn guess_rate(num_options: u32) -> f64 {
    1.0 / num_options.max(2) as f64
}

/// `(S - g) / (1 - g)`, capped at 1. A wrong answer scores below zero
/// (-1/3 for four options) so it outweighs the credit a lucky guess removes.
pub fn guess_corrected_score(correct: bool, num_options: u32) -> f64 {
    let raw = if correct { 1.0 } else { 0.0 };
    let g = guess_rate(num_options);
    ((raw - g) / (1.0 - g)).min(1.0)
}

pub fn expected_score(learner_rating: f64, item_rating: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((item_rating - learner_rating) / 400.0))
}

/// Bounded step multiplier from response time. Neutral inside `[fast_ms, slow_ms]`.
pub fn response_time_multiplier(response_time_ms: i64, config: &RatingConfig) -> f64 {
    let rt = &config.response_time;
    let m = if response_time_ms < rt.fast_ms {
        rt.fast_multiplier
    } else if response_time_ms > rt.slow_ms {
        rt.slow_multiplier
    } else {
        1.0
    };
    m.clamp(MIN_RT_MULTIPLIER, MAX_RT_MULTIPLIER)
}

/// RD going into an update: unset means maximum uncertainty, and idle time
/// may inflate it when configured.
pub fn effective_rd(state: &RatingState, at: DateTime<Utc>, config: &RatingConfig) -> f64 {
    let rd = state.rd.unwrap_or(config.rd_ceiling);
    let c = config.rd_idle_growth_per_day;

    let rd = match state.last_attempt_at {
        Some(last) if c > 0.0 => {
            let idle_days = (at - last).num_seconds().max(0) as f64 / 86_400.0;
            (rd * rd + c * c * idle_days).sqrt()
        }
        _ => rd,
    };

    rd.clamp(config.rd_floor, config.rd_ceiling)
}

pub fn shrink_rd(rd: f64, config: &RatingConfig) -> f64 {
    (rd * config.rd_shrink).clamp(config.rd_floor, config.rd_ceiling)
}

pub fn k_player(rd: f64, rt_multiplier: f64, config: &RatingConfig) -> f64 {
    config.k_player * (rd / config.rd_ceiling) * rt_multiplier
}

pub fn k_item(rd: f64, rt_multiplier: f64, config: &RatingConfig) -> f64 {
    config.k_player / config.item_k_divisor * (rd / config.rd_ceiling) * rt_multiplier
}

#[derive(Debug, Clone)]
pub struct UpdateInput {
    pub learner: RatingState,
    pub topic: RatingState,
    pub item: RatingState,
    /// Anchor items keep their rating and RD
    pub item_fixed: bool,
    pub correct: bool,
    pub response_time_ms: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub score: f64,
    pub expected: f64,
    pub learner: RatingChange,
    pub topic: RatingChange,
    pub item: RatingChange,
}

#[derive(Debug, Clone)]
pub struct RatingModel {
    config: RatingConfig,
}

impl RatingModel {
    pub fn new(config: RatingConfig) -> Self {
        Self { config }
    }

    pub fn rating_or_default(&self, state: &RatingState) -> f64 {
        state.rating.unwrap_or(self.config.default_rating)
    }

    pub fn update(&self, input: &UpdateInput) -> UpdateResult {
        let cfg = &self.config;
        let score = guess_corrected_score(input.correct, cfg.num_options);
        let rt_mult = response_time_multiplier(input.response_time_ms, cfg);

        let item_rating = self.rating_or_default(&input.item);
        let learner_rating = self.rating_or_default(&input.learner);
        let expected = expected_score(learner_rating, item_rating);

        let learner = self.player_step(&input.learner, item_rating, score, rt_mult, input.at);
        let topic = self.player_step(&input.topic, item_rating, score, rt_mult, input.at);

        let item_rd = effective_rd(&input.item, input.at, cfg);
        let item = if input.item_fixed {
            RatingChange {
                before: item_rating,
                after: item_rating,
                rd: input.item.rd.unwrap_or(item_rd),
            }
        } else {
            let k = k_item(item_rd, rt_mult, cfg);
            RatingChange {
                before: item_rating,
                after: item_rating + k * (expected - score),
                rd: shrink_rd(item_rd, cfg),
            }
        };

        UpdateResult {
            score,
            expected,
            learner,
            topic,
            item,
        }
    }

    fn player_step(
        &self,
        state: &RatingState,
        item_rating: f64,
        score: f64,
        rt_mult: f64,
        at: DateTime<Utc>,
    ) -> RatingChange {
        let cfg = &self.config;
        let before = self.rating_or_default(state);
        let rd = effective_rd(state, at, cfg);
        let expected = expected_score(before, item_rating);
        let k = k_player(rd, rt_mult, cfg);

        RatingChange {
            before,
            after: before + k * (score - expected),
            rd: shrink_rd(rd, cfg),
        }
    }
}
