// src/reinforcement/state_encoder.rs
use log::debug;
use serde::{Deserialize, Serialize};

use super::types::{ActionType, LearningPhase, LearningState, StateDims};
use crate::analytics::stats;
use crate::config;

/// Score bin used when grades are missing or too coarse to bin.
pub const SCORE_FALLBACK_BIN: u8 = 4;
pub const PROGRESS_BINS: u8 = 4;
pub const SCORE_BINS: u8 = 5;
pub const ENGAGEMENT_LEVELS: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Cut points between the four graded score bins
    pub score_thresholds: [f64; 3],
    /// Minimum cumulative max-score points needed to bin a score
    pub min_score_resolution: f64,
    pub progress_quantiles: [f64; 3],
    pub engagement_quantiles: [f64; 2],
    /// Rolling engagement window, days
    pub engagement_window_days: i64,
    /// Durations longer than this are truncated
    pub session_cap_secs: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            score_thresholds: config::SCORE_BIN_THRESHOLDS,
            min_score_resolution: config::MIN_SCORE_RESOLUTION,
            progress_quantiles: config::PROGRESS_QUANTILES,
            engagement_quantiles: config::ENGAGEMENT_QUANTILES,
            engagement_window_days: config::ENGAGEMENT_WINDOW_DAYS,
            session_cap_secs: config::SESSION_CAP_SECS,
        }
    }
}

/// Un-binned signals of a student at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignals {
    pub cluster_id: usize,
    pub module_index: u8,
    /// Events on the current module so far
    pub module_activity: u32,
    /// Sum of scores over sum of max scores, when anything was graded
    pub cumulative_score: Option<f64>,
    pub cumulative_max_score: f64,
    pub last_action: Option<ActionType>,
    /// Events in the rolling engagement window
    pub engagement: f64,
}

/// Maps raw signals onto a bounded `LearningState`.
///
/// Progress and engagement cut points are fitted once per run from the
/// historical distribution; score bins use fixed thresholds. Encoding is a
/// pure function of the signals and the fitted cut points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEncoder {
    score_thresholds: [f64; 3],
    min_score_resolution: f64,
    progress_cutoffs: [f64; 3],
    engagement_cutoffs: [f64; 2],
    dims: StateDims,
}

impl StateEncoder {
    pub fn calibrate(
        config: &EncoderConfig,
        signals: &[RawSignals],
        n_clusters: usize,
        n_modules: u8,
    ) -> Self {
        let activity: Vec<f64> = signals.iter().map(|s| s.module_activity as f64).collect();
        let engagement: Vec<f64> = signals.iter().map(|s| s.engagement).collect();
        let q = &config.progress_quantiles;
        let e = &config.engagement_quantiles;
        let progress_cutoffs = [
            stats::percentile(&activity, q[0]),
            stats::percentile(&activity, q[1]),
            stats::percentile(&activity, q[2]),
        ];
        let engagement_cutoffs = [
            stats::percentile(&engagement, e[0]),
            stats::percentile(&engagement, e[1]),
        ];
        debug!(
            "Encoder calibrated on {} signals: progress cutoffs {:?}, engagement cutoffs {:?}",
            signals.len(),
            progress_cutoffs,
            engagement_cutoffs
        );

        Self {
            score_thresholds: config.score_thresholds,
            min_score_resolution: config.min_score_resolution,
            progress_cutoffs,
            engagement_cutoffs,
            dims: StateDims {
                clusters: n_clusters.clamp(1, u8::MAX as usize) as u8,
                modules: n_modules.max(1),
                progress_bins: PROGRESS_BINS,
                score_bins: SCORE_BINS,
                phases: LearningPhase::COUNT,
                engagement_levels: ENGAGEMENT_LEVELS,
            },
        }
    }

    pub fn dims(&self) -> StateDims {
        self.dims
    }

    /// Number of cut points strictly below `value`.
    fn bin(value: f64, cutoffs: &[f64]) -> u8 {
        cutoffs.iter().filter(|c| **c < value).count() as u8
    }

    pub fn score_bin(&self, cumulative_score: Option<f64>, cumulative_max: f64) -> u8 {
        match cumulative_score {
            Some(s) if s.is_finite() && cumulative_max >= self.min_score_resolution => {
                let s = s.clamp(0.0, 1.0);
                self.score_thresholds.iter().filter(|t| s >= **t).count() as u8
            }
            _ => SCORE_FALLBACK_BIN,
        }
    }

    /// Total: out-of-range clusters and modules are clamped into the state space.
    pub fn encode(&self, signals: &RawSignals) -> LearningState {
        let cluster_id = signals
            .cluster_id
            .min(self.dims.clusters.saturating_sub(1) as usize) as u8;
        let module_index = signals.module_index.min(self.dims.last_module());
        let engagement = if signals.engagement.is_finite() {
            signals.engagement
        } else {
            0.0
        };
        LearningState {
            cluster_id,
            module_index,
            progress_bin: Self::bin(signals.module_activity as f64, &self.progress_cutoffs),
            score_bin: self.score_bin(signals.cumulative_score, signals.cumulative_max_score),
            learning_phase: signals
                .last_action
                .map(|a| a.phase())
                .unwrap_or(LearningPhase::PreLearning)
                .code(),
            engagement_level: Self::bin(engagement, &self.engagement_cutoffs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(activity: u32, engagement: f64) -> RawSignals {
        RawSignals {
            cluster_id: 0,
            module_index: 0,
            module_activity: activity,
            cumulative_score: None,
            cumulative_max_score: 0.0,
            last_action: None,
            engagement,
        }
    }

    fn encoder() -> StateEncoder {
        let history: Vec<RawSignals> = (0..=12).map(|i| signals(i, i as f64)).collect();
        StateEncoder::calibrate(&EncoderConfig::default(), &history, 3, 4)
    }

    #[test]
    fn cutoffs_come_from_the_data() {
        let enc = encoder();
        assert_eq!(enc.encode(&signals(0, 0.0)).progress_bin, 0);
        assert_eq!(enc.encode(&signals(12, 12.0)).progress_bin, 3);
        assert_eq!(enc.encode(&signals(0, 0.0)).engagement_level, 0);
        assert_eq!(enc.encode(&signals(12, 12.0)).engagement_level, 2);

        // Same relative activity in a busier course lands in the same bins
        let busy: Vec<RawSignals> = (0..=12).map(|i| signals(i * 10, i as f64 * 10.0)).collect();
        let busy_enc = StateEncoder::calibrate(&EncoderConfig::default(), &busy, 3, 4);
        assert_eq!(
            busy_enc.encode(&signals(60, 60.0)),
            enc.encode(&signals(6, 6.0))
        );
    }

    #[test]
    fn score_bins_and_fallback() {
        let enc = encoder();
        assert_eq!(enc.score_bin(Some(0.2), 10.0), 0);
        assert_eq!(enc.score_bin(Some(0.5), 10.0), 1);
        assert_eq!(enc.score_bin(Some(0.75), 10.0), 2);
        assert_eq!(enc.score_bin(Some(0.9), 10.0), 3);
        assert_eq!(enc.score_bin(None, 0.0), SCORE_FALLBACK_BIN);
        // One 2-point item is too coarse to bin
        assert_eq!(enc.score_bin(Some(1.0), 2.0), SCORE_FALLBACK_BIN);
    }

    #[test]
    fn encoding_is_total_and_pure() {
        let enc = encoder();
        let wild = RawSignals {
            cluster_id: 99,
            module_index: 200,
            module_activity: u32::MAX,
            cumulative_score: Some(f64::NAN),
            cumulative_max_score: 50.0,
            last_action: Some(ActionType::PostForum),
            engagement: f64::INFINITY,
        };
        let state = enc.encode(&wild);
        assert!(enc.dims().contains(&state));
        assert_eq!(state.learning_phase, LearningPhase::ReflectiveLearning.code());
        assert_eq!(enc.encode(&wild), state);
        assert_eq!(enc.dims().size(), 3 * 4 * 4 * 5 * 3 * 3);
    }
}
