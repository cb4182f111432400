// Engine configuration
//
// Every tunable of the rating model, the selection policy and the grade table
// lives here so they can be retuned from a TOML file without code changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_ENV: &str = "ETUDE_CONFIG";
const DB_ENV: &str = "ETUDE_DB";
const DEFAULT_DB_NAME: &str = "etude.db";
const DEFAULT_CONFIG_NAME: &str = "config.toml";

/// Hard bounds for response-time multipliers; they only scale an update, never flip it.
pub const MIN_RT_MULTIPLIER: f64 = 0.5;
pub const MAX_RT_MULTIPLIER: f64 = 1.5;

/// Upper bound on band window doublings; each one costs a store query.
pub const MAX_WIDENINGS: u32 = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rating: RatingConfig,
    pub selection: SelectionConfig,
    pub history: HistoryConfig,
    pub grades: Vec<GradeBand>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    /// Rating assigned to learners and items that have none yet
    pub default_rating: f64,
    /// Base learner step size at maximum uncertainty
    pub k_player: f64,
    /// Items move `item_k_divisor` times slower than learners
    pub item_k_divisor: f64,
    pub rd_floor: f64,
    pub rd_ceiling: f64,
    /// Multiplicative RD shrink applied after each attempt
    pub rd_shrink: f64,
    /// RD growth constant per idle day; 0 disables inflation
    pub rd_idle_growth_per_day: f64,
    /// Options shown per multiple-choice item
    pub num_options: u32,
    pub response_time: ResponseTimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseTimeConfig {
    pub fast_ms: i64,
    pub slow_ms: i64,
    pub fast_multiplier: f64,
    pub slow_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub near_probability: f64,
    pub explore_probability: f64,
    pub review_probability: f64,
    /// Half-width of the near band around the reference rating
    pub near_tolerance: f64,
    pub explore_offset: f64,
    pub review_offset: f64,
    /// Half-width of the explore/review bands around their offset centre
    pub offset_tolerance: f64,
    /// How many times the tolerance window may double before falling back
    pub max_widenings: u32,
    /// Retry without recency exclusion when it empties the candidate set
    pub relax_recency: bool,
    /// Consecutive attempts in one topic before topic bias moves on
    pub max_topic_streak: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub window: usize,
}

/// Half-open rating band `[min, max)` mapped to a grade label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub label: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub busy_timeout_ms: u64,
    pub max_commit_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rating: RatingConfig::default(),
            selection: SelectionConfig::default(),
            history: HistoryConfig::default(),
            grades: default_grade_table(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            default_rating: 1000.0,
            k_player: 32.0,
            item_k_divisor: 3.0,
            rd_floor: 50.0,
            rd_ceiling: 350.0,
            rd_shrink: 0.94,
            rd_idle_growth_per_day: 0.0,
            num_options: 4,
            response_time: ResponseTimeConfig::default(),
        }
    }
}

impl Default for ResponseTimeConfig {
    fn default() -> Self {
        Self {
            fast_ms: 1_500,
            slow_ms: 20_000,
            fast_multiplier: 1.0,
            slow_multiplier: 1.0,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            near_probability: 0.7,
            explore_probability: 0.2,
            review_probability: 0.1,
            near_tolerance: 60.0,
            explore_offset: 100.0,
            review_offset: 100.0,
            offset_tolerance: 40.0,
            max_widenings: 3,
            relax_recency: true,
            max_topic_streak: 4,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { window: 5 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 2_000,
            max_commit_retries: 3,
        }
    }
}

pub fn default_grade_table() -> Vec<GradeBand> {
    [
        ("Grade 1", 900.0, 1050.0),
        ("Grade 2", 1050.0, 1150.0),
        ("Grade 3", 1150.0, 1250.0),
        ("Grade 4", 1250.0, 1350.0),
        ("Grade 5", 1350.0, 1450.0),
        ("Grade 6", 1450.0, 1550.0),
    ]
    .into_iter()
    .map(|(label, min, max)| GradeBand {
        label: label.to_string(),
        min,
        max,
    })
    .collect()
}

impl EngineConfig {
    /// Load from `ETUDE_CONFIG`, then the user config dir, then defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let default_path = config_dir().join(DEFAULT_CONFIG_NAME);
        if default_path.exists() {
            return Self::from_file(&default_path);
        }

        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.rating;
        check(r.default_rating.is_finite(), "rating.default_rating must be finite")?;
        check(r.k_player > 0.0, "rating.k_player must be positive")?;
        check(r.item_k_divisor > 0.0, "rating.item_k_divisor must be positive")?;
        check(
            r.rd_floor > 0.0 && r.rd_floor < r.rd_ceiling,
            "rating.rd_floor must be positive and below rating.rd_ceiling",
        )?;
        check(
            r.rd_shrink > 0.0 && r.rd_shrink <= 1.0,
            "rating.rd_shrink must be in (0, 1]",
        )?;
        check(
            r.rd_idle_growth_per_day >= 0.0,
            "rating.rd_idle_growth_per_day must not be negative",
        )?;
        check(r.num_options >= 2, "rating.num_options must be at least 2")?;

        let rt = &r.response_time;
        check(
            rt.fast_ms >= 0 && rt.fast_ms < rt.slow_ms,
            "rating.response_time.fast_ms must be below slow_ms",
        )?;
        for m in [rt.fast_multiplier, rt.slow_multiplier] {
            check(
                (MIN_RT_MULTIPLIER..=MAX_RT_MULTIPLIER).contains(&m),
                "response time multipliers must be within [0.5, 1.5]",
            )?;
        }

        let s = &self.selection;
        let probs = [s.near_probability, s.explore_probability, s.review_probability];
        check(
            probs.iter().all(|p| *p >= 0.0),
            "band probabilities must not be negative",
        )?;
        check(
            (probs.iter().sum::<f64>() - 1.0).abs() < 1e-9,
            "band probabilities must sum to 1",
        )?;
        check(
            s.near_tolerance > 0.0 && s.offset_tolerance > 0.0,
            "band tolerances must be positive",
        )?;
        check(s.max_topic_streak >= 1, "selection.max_topic_streak must be at least 1")?;
        check(
            s.max_widenings <= MAX_WIDENINGS,
            &format!("selection.max_widenings must be at most {}", MAX_WIDENINGS),
        )?;

        check(self.history.window >= 1, "history.window must be at least 1")?;
        check(
            self.storage.max_commit_retries >= 1,
            "storage.max_commit_retries must be at least 1",
        )?;

        validate_grades(&self.grades)
    }
}

fn validate_grades(grades: &[GradeBand]) -> Result<(), ConfigError> {
    check(!grades.is_empty(), "grade table must not be empty")?;
    for band in grades {
        check(
            band.min < band.max,
            &format!("grade band '{}' must have min < max", band.label),
        )?;
    }
    for pair in grades.windows(2) {
        check(
            pair[0].max == pair[1].min,
            &format!(
                "grade bands '{}' and '{}' must be contiguous",
                pair[0].label, pair[1].label
            ),
        )?;
    }
    Ok(())
}

fn check(cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::Validation(msg.to_string()))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("etude")
}

pub fn db_path() -> PathBuf {
    if let Ok(path) = std::env::var(DB_ENV) {
        return PathBuf::from(path);
    }

    let dir = config_dir();
    std::fs::create_dir_all(&dir).ok();
    dir.join(DEFAULT_DB_NAME)
}
