// src/results.rs

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::clustering::TransitionCounts;
use crate::analytics::ingest::IngestReport;
use crate::models::{CourseId, RunWindow};
use crate::reinforcement::TransitionModelSummary;

/// Clustering figures of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub optimal_k: usize,
    pub candidates_evaluated: usize,
    pub silhouette: f64,
    pub composite: f64,
    pub cluster_sizes: Vec<usize>,
    pub transitions: TransitionCounts,
}

/// Training figures of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub observed_transitions: usize,
    pub unmapped_events: usize,
    pub visited_states: usize,
    pub state_space_size: usize,
    pub episodes: usize,
    pub converged: bool,
    pub final_epsilon: f64,
    pub max_abs_q: f64,
    /// Mean reward of the last simulated episodes
    pub recent_mean_reward: f64,
    pub model: TransitionModelSummary,
}

/// Complete statistics of one course run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub course_id: CourseId,
    pub run_timestamp: DateTime<Utc>,
    pub window: RunWindow,
    pub seed: u64,

    pub ingest: IngestReport,
    pub features_extracted: usize,
    pub features_retained: usize,
    pub selection_fallback_used: bool,

    pub cluster_stats: Option<ClusterStats>,
    pub training_stats: Option<TrainingStats>,

    /// Seconds spent per pipeline phase
    pub phase_times: BTreeMap<String, f64>,
    pub total_processing_time: f64,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        course_id: CourseId,
        run_timestamp: DateTime<Utc>,
        window: RunWindow,
        seed: u64,
    ) -> Self {
        Self {
            run_id,
            course_id,
            run_timestamp,
            window,
            seed,
            ingest: IngestReport::default(),
            features_extracted: 0,
            features_retained: 0,
            selection_fallback_used: false,
            cluster_stats: None,
            training_stats: None,
            phase_times: BTreeMap::new(),
            total_processing_time: 0.0,
        }
    }

    pub fn record_phase(&mut self, phase: &str, elapsed: Duration) {
        self.phase_times
            .insert(phase.to_string(), elapsed.as_secs_f64());
    }

    pub fn log_summary(&self) {
        info!(
            "Run {} of course {} finished in {:.2}s: {} students, {} skipped records, {}/{} features kept",
            self.run_id,
            self.course_id,
            self.total_processing_time,
            self.ingest.students,
            self.ingest.skipped_records(),
            self.features_retained,
            self.features_extracted
        );
        if let Some(c) = &self.cluster_stats {
            info!(
                "  clustering: k={} (silhouette {:.3}, composite {:.3}), sizes {:?}, {} stable / {} moved / {} initial",
                c.optimal_k,
                c.silhouette,
                c.composite,
                c.cluster_sizes,
                c.transitions.stable,
                c.transitions.moved,
                c.transitions.initial
            );
        }
        if let Some(t) = &self.training_stats {
            info!(
                "  training: {} transitions, {}/{} states visited, {} episodes, converged={}, max |Q| {:.3}",
                t.observed_transitions,
                t.visited_states,
                t.state_space_size,
                t.episodes,
                t.converged,
                t.max_abs_q
            );
        }
        for (phase, secs) in &self.phase_times {
            info!("  {:<24} {:.3}s", phase, secs);
        }
    }
}

/// Times consecutive phases of a run.
pub struct PhaseTimer {
    run_start: Instant,
    phase_start: Instant,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::start()
    }
}

impl PhaseTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            run_start: now,
            phase_start: now,
        }
    }

    /// Records the phase that just ended into `report` and starts the next one.
    pub fn lap(&mut self, report: &mut RunReport, phase: &str) {
        report.record_phase(phase, self.phase_start.elapsed());
        self.phase_start = Instant::now();
    }

    pub fn finish(self, report: &mut RunReport) {
        report.total_processing_time = self.run_start.elapsed().as_secs_f64();
    }
}
