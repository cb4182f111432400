use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ItemId = i64;
pub type TopicId = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learner {
    pub id: String,
    /// `None` until the first attempt commits
    pub rating: Option<f64>,
    pub rd: Option<f64>,
    pub attempt_count: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Learner {
    pub fn rating_state(&self) -> RatingState {
        RatingState {
            rating: self.rating,
            rd: self.rd,
            attempts: self.attempt_count,
            last_attempt_at: self.last_attempt_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// Per-(learner, topic) rating; only exists once the learner has attempted the topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRating {
    pub learner_id: String,
    pub topic_id: TopicId,
    pub topic_name: String,
    pub rating: f64,
    pub rd: f64,
    pub attempt_count: i64,
    pub last_attempt_at: DateTime<Utc>,
}

impl TopicRating {
    pub fn rating_state(&self) -> RatingState {
        RatingState {
            rating: Some(self.rating),
            rd: Some(self.rd),
            attempts: self.attempt_count,
            last_attempt_at: Some(self.last_attempt_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub topic_id: TopicId,
    pub target_grade: Option<String>,
    pub rating: Option<f64>,
    pub rd: Option<f64>,
    pub active: bool,
    /// Anchor items hold a fixed calibrated rating
    pub anchor: bool,
    /// Expected answer text, for items where two questions can share an answer
    pub answer_text: Option<String>,
    pub metadata: serde_json::Value,
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn rating_state(&self) -> RatingState {
        RatingState {
            rating: self.rating,
            rd: self.rd,
            attempts: self.attempt_count,
            last_attempt_at: self.last_attempt_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewItem {
    pub topic_id: TopicId,
    pub target_grade: Option<String>,
    pub rating: Option<f64>,
    pub anchor: bool,
    pub answer_text: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// Immutable attempt log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub learner_id: String,
    pub item_id: ItemId,
    pub topic_id: TopicId,
    pub correct: bool,
    pub response_time_ms: i64,
    pub attempted_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub learner: RatingChange,
    pub topic: RatingChange,
    pub item: RatingChange,
}

/// Rating and RD as stored; either may be unset for a new entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingState {
    pub rating: Option<f64>,
    pub rd: Option<f64>,
    pub attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub learner_id: String,
    pub item_id: ItemId,
    pub correct: bool,
    pub response_time_ms: i64,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub before: f64,
    pub after: f64,
    pub rd: f64,
}

impl RatingChange {
    pub fn delta(&self) -> f64 {
        self.after - self.before
    }
}

// A recent attempt as seen by the history guard and topic streak check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentAttempt {
    pub item_id: ItemId,
    pub topic_id: TopicId,
    pub answer_text: Option<String>,
}

// Topic eligible for selection, with the learner's standing in it (if any)
#[derive(Debug, Clone, PartialEq)]
pub struct TopicStanding {
    pub topic_id: TopicId,
    pub rating: Option<f64>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub attempt_id: i64,
    pub learner: RatingChange,
    pub topic: RatingChange,
    pub item: RatingChange,
    /// True when the idempotency key matched an attempt already on record
    pub replayed: bool,
}

impl AttemptOutcome {
    pub fn from_attempt(attempt: &Attempt, replayed: bool) -> Self {
        Self {
            attempt_id: attempt.id,
            learner: attempt.learner,
            topic: attempt.topic,
            item: attempt.item,
            replayed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Near,
    Explore,
    Review,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Near => "near",
            Band::Explore => "explore",
            Band::Review => "review",
        }
    }
}

/// Which fallback stage produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum SelectionStage {
    Band { widenings: u32 },
    AnyInTopic,
    AnyActive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub item_id: ItemId,
    pub topic_id: TopicId,
    pub band: Band,
    pub stage: SelectionStage,
    pub reference_rating: f64,
    /// True when recency exclusion had to be dropped to find an item
    pub recency_relaxed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic_id: TopicId,
    pub topic_name: String,
    pub rating: f64,
    pub rd: f64,
    pub attempt_count: i64,
    pub grade_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingSummary {
    pub learner_id: String,
    pub global_rating: f64,
    pub global_rd: f64,
    pub attempt_count: i64,
    pub grade_label: String,
    pub topics: Vec<TopicSummary>,
}

#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod band_tests {
        use super::*;

        #[test]
        fn as_str_matches_serde() {
            for band in [Band::Near, Band::Explore, Band::Review] {
                let json = serde_json::to_string(&band).unwrap();
                assert_eq!(json, format!("\"{}\"", band.as_str()));
            }
        }
    }

    mod rating_change_tests {
        use super::*;

        #[test]
        fn delta_is_after_minus_before() {
            let change = RatingChange {
                before: 1000.0,
                after: 1016.0,
                rd: 329.0,
            };
            assert_eq!(change.delta(), 16.0);
        }
    }

    mod selection_stage_tests {
        use super::*;

        #[test]
        fn band_stage_serializes_with_widenings() {
            let json = serde_json::to_value(SelectionStage::Band { widenings: 2 }).unwrap();
            assert_eq!(json["stage"], "band");
            assert_eq!(json["widenings"], 2);
        }

        #[test]
        fn fallback_stages_serialize_as_tags() {
            let json = serde_json::to_value(SelectionStage::AnyActive).unwrap();
            assert_eq!(json["stage"], "any_active");
        }
    }

    mod json_output_tests {
        use super::*;

        #[test]
        fn ok_with_string() {
            let output = JsonOutput::ok("test data");
            assert!(output.success);
            assert_eq!(output.data, Some("test data"));
            assert!(output.error.is_none());
        }

        #[test]
        fn err_with_message() {
            let output = JsonOutput::<()>::err("no eligible items");
            assert!(!output.success);
            assert!(output.data.is_none());
            assert_eq!(output.error, Some("no eligible items".to_string()));
        }

        #[test]
        fn serializes_envelope() {
            let output = JsonOutput::ok(serde_json::json!({"item_id": 7}));
            let json = serde_json::to_string(&output).unwrap();
            assert!(json.contains("\"success\":true"));
            assert!(json.contains("\"item_id\":7"));
            assert!(json.contains("\"error\":null"));
        }
    }
}
