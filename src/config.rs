// src/config.rs
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::analytics::clustering::ClusteringConfig;
use crate::analytics::features::{FeatureConfig, SelectionConfig};
use crate::errors::AnalyticsError;
use crate::pipeline::SchedulerConfig;
use crate::reinforcement::{EncoderConfig, RewardWeights, ServingConfig, TrainerConfig};

// --- Feature extraction ---

/// Column holding the mean normalized grade of a student
pub const FEATURE_GRADE_MEAN: &str = "grade:mean";
/// Column holding the graded-item rate of a student
pub const FEATURE_GRADE_COUNT: &str = "grade:count";

// --- Feature selection ---

/// Min-max scaled variance below which a column is dropped
pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.01;
/// |Pearson r| above which the less important column of a pair is dropped
pub const DEFAULT_CORRELATION_THRESHOLD: f64 = 0.95;
pub const DEFAULT_MAX_FEATURES: usize = 30;
/// Columns kept by raw variance when the thresholds remove everything
pub const DEFAULT_FALLBACK_TOP_K: usize = 5;
pub const IMPORTANCE_VARIANCE_WEIGHT: f64 = 0.6;
pub const IMPORTANCE_LABEL_WEIGHT: f64 = 0.4;

// --- Clustering ---

pub const DEFAULT_K_MIN: usize = 2;
pub const DEFAULT_K_MAX: usize = 10;
/// Clustering is declined below this many students
pub const MIN_STUDENTS_FOR_CLUSTERING: usize = 10;
pub const DEFAULT_SEED: u64 = 42;
/// Multiplier separating per-purpose RNG streams derived from one run seed
pub const SEED_STREAM_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;
/// Stream offset of the Q-learning episode sampler
pub const TRAINER_SEED_STREAM: u64 = 0x5154_4142;
pub const GMM_N_INIT: usize = 3;
pub const GMM_MAX_ITER: usize = 200;
/// Mean per-sample log-likelihood improvement that ends EM
pub const GMM_TOLERANCE: f64 = 1e-4;
/// Variance floor added to every mixture component (standardized units)
pub const GMM_REG_COVAR: f64 = 1e-4;
pub const DEFAULT_BIC_WEIGHT: f64 = 0.5;
pub const DEFAULT_AIC_WEIGHT: f64 = 0.0;
pub const DEFAULT_SILHOUETTE_WEIGHT: f64 = 0.5;
pub const DEFAULT_DAVIES_BOULDIN_WEIGHT: f64 = 0.0;
pub const PROFILE_TOP_FEATURES: usize = 5;

// --- State encoding ---

/// Normalized cumulative score cut points between the four graded bins
pub const SCORE_BIN_THRESHOLDS: [f64; 3] = [0.5, 0.7, 0.85];
/// Below this many cumulative max-score points the fallback score bin is used
pub const MIN_SCORE_RESOLUTION: f64 = 4.0;
pub const PROGRESS_QUANTILES: [f64; 3] = [0.25, 0.5, 0.75];
pub const ENGAGEMENT_QUANTILES: [f64; 2] = [1.0 / 3.0, 2.0 / 3.0];
pub const ENGAGEMENT_WINDOW_DAYS: i64 = 7;
/// Gap between two events beyond which the first is treated as a session end
pub const SESSION_CAP_SECS: f64 = 3600.0;

// --- Rewards ---
// The mastery bonus is meant to sit 5-15x above the per-step cost so real
// learning gains outweigh busywork.

pub const REWARD_STEP_COST: f64 = 0.1;
pub const REWARD_TIME_COST_PER_MINUTE: f64 = 0.01;
pub const REWARD_PROGRESS_GAIN: f64 = 0.5;
pub const REWARD_SCORE_GAIN: f64 = 0.75;
pub const REWARD_MASTERY_BONUS: f64 = 1.0;
pub const MASTERY_BONUS_MIN_RATIO: f64 = 5.0;
pub const MASTERY_BONUS_MAX_RATIO: f64 = 15.0;

// Learning rate per mastery tier; weak mastery learns fastest
pub const LEARNING_RATE_WEAK: f64 = 0.30;
pub const LEARNING_RATE_DEVELOPING: f64 = 0.20;
pub const LEARNING_RATE_PROFICIENT: f64 = 0.10;
pub const LEARNING_RATE_MASTERED: f64 = 0.05;

// --- Training ---

pub const DISCOUNT_FACTOR: f64 = 0.9;
pub const EPSILON_START: f64 = 1.0;
pub const EPSILON_MIN: f64 = 0.05;
pub const EPSILON_DECAY: f64 = 0.995;
pub const EPISODE_LENGTH: usize = 20;
pub const MAX_EPISODES: usize = 3000;
pub const MIN_EPISODES: usize = 200;
/// Mean |dQ| per sweep below which training stops
pub const CONVERGENCE_TOLERANCE: f64 = 1e-3;
/// Episodes averaged when checking the convergence tolerance
pub const CONVERGENCE_WINDOW: usize = 50;
/// Passes over the observed transitions before simulated episodes start
pub const OBSERVED_REPLAY_PASSES: usize = 3;
/// |Q| sanity bound; exceeding it aborts the run
pub const Q_DIVERGENCE_BOUND: f64 = 1e6;
/// Laplace pseudo-count of the empirical action distribution
pub const LAPLACE_ALPHA: f64 = 1.0;
/// Observed durations kept per action type for the simulator
pub const DURATION_SAMPLES_PER_ACTION: usize = 256;
/// Duration used for action types never observed, and for a lone event
pub const DEFAULT_ACTION_DURATION_SECS: f64 = 300.0;
/// Transitions below which a course is not trained
pub const MIN_TRANSITIONS_FOR_TRAINING: usize = 20;

// --- Serving ---

pub const DEFAULT_TOP_K: usize = 3;
pub const SOFTMAX_TEMPERATURE: f64 = 1.0;

// --- Scheduling & retries ---

pub const DEFAULT_WINDOW_DAYS: i64 = 28;
pub const RETRY_MAX_RETRIES: u32 = 3;
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 200;
pub const RETRY_MAX_BACKOFF_MS: u64 = 5_000;
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    #[default]
    File,
    Postgres,
}

impl std::str::FromStr for SnapshotBackend {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "files" => Ok(SnapshotBackend::File),
            "postgres" | "pg" => Ok(SnapshotBackend::Postgres),
            other => Err(AnalyticsError::InvalidConfig(format!(
                "unknown snapshot backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: SnapshotBackend,
    /// Directory holding one `<course>.json` dataset per course
    pub data_dir: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: SnapshotBackend::File,
            data_dir: PathBuf::from("data"),
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

/// Complete engine configuration. Every field defaults to the constants above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run seed every stochastic stage derives its stream from
    pub seed: u64,
    pub features: FeatureConfig,
    pub selection: SelectionConfig,
    pub clustering: ClusteringConfig,
    pub encoder: EncoderConfig,
    pub rewards: RewardWeights,
    pub trainer: TrainerConfig,
    pub serving: ServingConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            features: FeatureConfig::default(),
            selection: SelectionConfig::default(),
            clustering: ClusteringConfig::default(),
            encoder: EncoderConfig::default(),
            rewards: RewardWeights::default(),
            trainer: TrainerConfig::default(),
            serving: ServingConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the JSON file named by `PATHWISE_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("PATHWISE_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                info!("Loaded engine configuration from {}", path);
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path))?
            }
            Err(_) => EngineConfig::default(),
        };

        if let Ok(seed) = std::env::var("PATHWISE_SEED") {
            config.seed = seed
                .parse()
                .with_context(|| format!("PATHWISE_SEED is not a u64: {}", seed))?;
        }
        if let Ok(dir) = std::env::var("PATHWISE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PATHWISE_SNAPSHOT_DIR") {
            config.storage.snapshot_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("PATHWISE_SNAPSHOT_BACKEND") {
            config.storage.backend = backend.parse()?;
        }

        config.clustering.seed = config.seed;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AnalyticsError> {
        let c = &self.clustering;
        if c.k_min < 2 || c.k_min > c.k_max {
            return Err(AnalyticsError::InvalidConfig(format!(
                "cluster range {}..={} is empty or starts below 2",
                c.k_min, c.k_max
            )));
        }
        let unit = |name: &str, v: f64| {
            if v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(AnalyticsError::InvalidConfig(format!(
                    "{} must lie in (0, 1), got {}",
                    name, v
                )))
            }
        };
        unit("variance_threshold", self.selection.variance_threshold)?;
        unit("correlation_threshold", self.selection.correlation_threshold)?;
        for t in self.encoder.score_thresholds {
            unit("score threshold", t)?;
        }
        if !self
            .encoder
            .score_thresholds
            .windows(2)
            .all(|w| w[0] < w[1])
        {
            return Err(AnalyticsError::InvalidConfig(
                "score thresholds must be strictly increasing".into(),
            ));
        }

        let t = &self.trainer;
        for (name, v) in [
            ("epsilon_start", t.epsilon_start),
            ("epsilon_min", t.epsilon_min),
            ("epsilon_decay", t.epsilon_decay),
            ("discount", t.discount),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(AnalyticsError::InvalidConfig(format!(
                    "{} must lie in [0, 1], got {}",
                    name, v
                )));
            }
        }

        let r = &self.rewards;
        if r.step_cost > 0.0 {
            let ratio = r.mastery_bonus / r.step_cost;
            if !(MASTERY_BONUS_MIN_RATIO..=MASTERY_BONUS_MAX_RATIO).contains(&ratio) {
                warn!(
                    "Mastery bonus is {:.1}x the step cost; expected between {}x and {}x",
                    ratio, MASTERY_BONUS_MIN_RATIO, MASTERY_BONUS_MAX_RATIO
                );
            }
        }
        Ok(())
    }
}
