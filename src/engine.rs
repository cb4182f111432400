use chrono::{DateTime, Utc};
use rand::Rng;
use std::path::Path;
use tracing::info;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::grade::GradeMapper;
use crate::history::HistoryGuard;
use crate::models::{
    AttemptOutcome, AttemptRequest, RatingSummary, RecentAttempt, Selection, TopicId,
    TopicSummary,
};
use crate::rating::{RatingModel, UpdateInput};
use crate::selection::{SelectionContext, SelectionPolicy};

/// The three inbound operations, wired over one store connection.
pub struct Engine {
    db: Database,
    config: EngineConfig,
    model: RatingModel,
    policy: SelectionPolicy,
    grades: GradeMapper,
}

impl Engine {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        let model = RatingModel::new(config.rating.clone());
        let policy = SelectionPolicy::new(config.selection.clone(), config.rating.default_rating);
        let grades = GradeMapper::new(config.grades.clone());
        Self {
            db,
            config,
            model,
            policy,
            grades,
        }
    }

    /// Opens (and initialises) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let db = Database::open_with(path, &config.storage)?;
        db.init()?;
        Ok(Self::new(db, config))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn grades(&self) -> &GradeMapper {
        &self.grades
    }

    /// Trailing history window for a learner, derived from the attempt log.
    pub fn history(&self, learner_id: &str) -> Result<HistoryGuard> {
        let guard = HistoryGuard::new(self.config.history.window);
        let recent = self.db.recent_attempts(learner_id, guard.window())?;
        Ok(fill_history(guard, learner_id, &recent))
    }

    pub fn select_next<R: Rng + ?Sized>(
        &self,
        learner_id: &str,
        topic_hint: Option<TopicId>,
        rng: &mut R,
    ) -> Result<Selection> {
        if learner_id.trim().is_empty() {
            return Err(EngineError::invalid("learner id must not be empty"));
        }

        let learner = self.db.ensure_learner(learner_id)?;
        if !learner.active {
            return Err(EngineError::invalid(format!(
                "learner '{}' is deactivated",
                learner_id
            )));
        }

        // One read covers both the history window and the topic streak check
        let lookback = self
            .config
            .history
            .window
            .max(self.config.selection.max_topic_streak);
        let recent = self.db.recent_attempts(learner_id, lookback)?;

        let history = fill_history(
            HistoryGuard::new(self.config.history.window),
            learner_id,
            &recent,
        );

        let ctx = SelectionContext {
            learner: &learner,
            topic_hint,
            recent: &recent,
            history: &history,
        };
        self.policy.select(&self.db, &ctx, rng)
    }

    pub fn record_attempt(&self, request: &AttemptRequest, now: DateTime<Utc>) -> Result<AttemptOutcome> {
        if request.response_time_ms < 0 {
            return Err(EngineError::invalid(format!(
                "negative response time: {}ms",
                request.response_time_ms
            )));
        }

        let (attempt, replayed) = self.db.commit_attempt(request, now, |snapshot| {
            self.model.update(&UpdateInput {
                learner: snapshot.learner.rating_state(),
                topic: snapshot
                    .topic_rating
                    .as_ref()
                    .map(|t| t.rating_state())
                    .unwrap_or_default(),
                item: snapshot.item.rating_state(),
                item_fixed: snapshot.item.anchor,
                correct: request.correct,
                response_time_ms: request.response_time_ms,
                at: snapshot.attempted_at,
            })
        })?;

        if replayed {
            info!(
                learner = %attempt.learner_id,
                item = attempt.item_id,
                attempt = attempt.id,
                "replayed attempt from idempotency key"
            );
        } else {
            info!(
                learner = %attempt.learner_id,
                item = attempt.item_id,
                correct = attempt.correct,
                learner_delta = attempt.learner.delta(),
                topic_delta = attempt.topic.delta(),
                item_delta = attempt.item.delta(),
                "recorded attempt"
            );
        }

        Ok(AttemptOutcome::from_attempt(&attempt, replayed))
    }

    pub fn rating_summary(&self, learner_id: &str) -> Result<RatingSummary> {
        let learner = self
            .db
            .get_learner(learner_id)?
            .ok_or_else(|| EngineError::invalid(format!("unknown learner '{}'", learner_id)))?;

        let global_rating = self.model.rating_or_default(&learner.rating_state());
        let global_rd = learner.rd.unwrap_or(self.config.rating.rd_ceiling);

        let topics = self
            .db
            .list_topic_ratings(learner_id)?
            .into_iter()
            .map(|t| TopicSummary {
                grade_label: self.grades.grade_for(t.rating).to_string(),
                topic_id: t.topic_id,
                topic_name: t.topic_name,
                rating: t.rating,
                rd: t.rd,
                attempt_count: t.attempt_count,
            })
            .collect();

        Ok(RatingSummary {
            learner_id: learner.id,
            global_rating,
            global_rd,
            attempt_count: learner.attempt_count,
            grade_label: self.grades.grade_for(global_rating).to_string(),
            topics,
        })
    }
}

// Replays attempts (oldest first) into the guard; older entries fall out of the window.
fn fill_history(mut guard: HistoryGuard, learner_id: &str, recent: &[RecentAttempt]) -> HistoryGuard {
    for attempt in recent {
        guard.record(learner_id, attempt.item_id, attempt.answer_text.as_deref());
    }
    guard
}
