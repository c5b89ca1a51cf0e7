// src/analytics/clustering/mod.rs
mod gmm;
mod kmeans;
mod metrics;
pub mod reconcile;
mod selector;

pub use gmm::{GaussianMixture, GmmParams};
pub use kmeans::{KMeansResult, kmeans, nearest_centroid};
pub use metrics::{davies_bouldin, non_empty_clusters, silhouette};
pub use reconcile::{
    ClusterTransition, ClusterTransitionRecord, ProfileDistance, ProfileMatching,
    TransitionCounts, TransitionLedger, TransitionType, match_profiles,
};
pub use selector::{
    CandidateEvaluation, CandidateFit, ClusterAssignment, ClusterProfile, ClusterSelector,
    ClusterSummary, ClusteringConfig, CompositeWeights, QualityMetrics, TopFeature,
};
