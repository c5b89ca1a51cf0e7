// src/reinforcement/mod.rs
pub mod action_catalog;
pub mod policy;
pub mod q_learning;
pub mod q_table;
pub mod recommender;
pub mod reward;
pub mod state_encoder;
pub mod trajectory;
pub mod transition_model;
pub mod types;

pub use action_catalog::{ActionCatalog, CATALOG_VERSION};
pub use policy::{PolicyRegistry, QRow, QTableSnapshot, SnapshotMeta, state_distance};
pub use q_learning::{ExplorationState, QLearningTrainer, TrainerConfig, TrainingOutcome};
pub use q_table::QTable;
pub use recommender::{
    Recommendation, RecommendationResponse, RecommendationServer, Resolution, ServingConfig,
};
pub use reward::{LearningRates, MasteryTier, RewardWeights};
pub use state_encoder::{EncoderConfig, RawSignals, SCORE_FALLBACK_BIN, StateEncoder};
pub use trajectory::{TrajectorySet, build_trajectories};
pub use transition_model::{
    DeltaStats, DurationStats, SimulatedStep, TransitionModel, TransitionModelSummary,
};
pub use types::{
    Action, ActionType, LearningPhase, LearningState, StateDims, TemporalContext, Transition,
};
