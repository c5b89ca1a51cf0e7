// src/reinforcement/trajectory.rs
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use super::reward::RewardWeights;
use super::state_encoder::{EncoderConfig, RawSignals, StateEncoder};
use super::types::{Action, ActionType, LearningState, StateDims, TemporalContext, Transition};
use crate::config;
use crate::models::{CourseDataset, StudentActivity, StudentId};

/// Observed transitions of one run plus the encoder they were encoded with.
#[derive(Debug, Clone)]
pub struct TrajectorySet {
    pub encoder: StateEncoder,
    pub transitions: Vec<Transition>,
    /// Latest state of every student, including students without mapped events
    pub student_states: BTreeMap<StudentId, LearningState>,
    /// First state of every student
    pub start_states: Vec<LearningState>,
    pub unmapped_events: usize,
}

impl TrajectorySet {
    pub fn dims(&self) -> StateDims {
        self.encoder.dims()
    }

    /// Most frequent start state, ties to the smallest state.
    pub fn modal_start_state(&self) -> Option<LearningState> {
        let mut counts: BTreeMap<LearningState, usize> = BTreeMap::new();
        for s in &self.start_states {
            *counts.entry(*s).or_default() += 1;
        }
        let mut best: Option<(LearningState, usize)> = None;
        for (state, n) in counts {
            if best.is_none_or(|(_, b)| n > b) {
                best = Some((state, n));
            }
        }
        best.map(|(s, _)| s)
    }
}

/// Running view of one student while their events are replayed in order.
struct Walker<'a> {
    student: &'a StudentActivity,
    cluster_id: usize,
    window_days: i64,
    frontier: u8,
    module_activity: HashMap<u8, u32>,
    score_sum: f64,
    max_sum: f64,
    graded: bool,
    next_grade: usize,
    last_action: Option<ActionType>,
    recent: VecDeque<DateTime<Utc>>,
}

impl<'a> Walker<'a> {
    fn new(student: &'a StudentActivity, cluster_id: usize, window_days: i64) -> Self {
        Self {
            student,
            cluster_id,
            window_days,
            frontier: 0,
            module_activity: HashMap::new(),
            score_sum: 0.0,
            max_sum: 0.0,
            graded: false,
            next_grade: 0,
            last_action: None,
            recent: VecDeque::new(),
        }
    }

    /// Folds in every grade recorded strictly before `until` (all of them for `None`).
    fn absorb_grades(&mut self, until: Option<DateTime<Utc>>) {
        while let Some(g) = self.student.grades.get(self.next_grade) {
            if until.is_some_and(|t| g.timestamp >= t) {
                break;
            }
            self.score_sum += g.score;
            self.max_sum += g.max_score;
            self.graded = true;
            self.next_grade += 1;
        }
    }

    fn record_event(&mut self, module: u8, at: DateTime<Utc>, action: Option<ActionType>) {
        self.frontier = self.frontier.max(module);
        *self.module_activity.entry(module).or_default() += 1;
        if action.is_some() {
            self.last_action = action;
        }
        self.recent.push_back(at);
        let horizon = at - Duration::days(self.window_days);
        while self.recent.front().is_some_and(|t| *t <= horizon) {
            self.recent.pop_front();
        }
    }

    fn signals(&self) -> RawSignals {
        RawSignals {
            cluster_id: self.cluster_id,
            module_index: self.frontier,
            module_activity: self
                .module_activity
                .get(&self.frontier)
                .copied()
                .unwrap_or(0),
            cumulative_score: (self.graded && self.max_sum > 0.0)
                .then(|| self.score_sum / self.max_sum),
            cumulative_max_score: self.max_sum,
            last_action: self.last_action,
            engagement: self.recent.len() as f64,
        }
    }
}

struct RawStep {
    before: RawSignals,
    after: RawSignals,
    action: Action,
    duration_secs: f64,
}

struct RawTrajectory {
    student_id: StudentId,
    initial: RawSignals,
    last: RawSignals,
    steps: Vec<RawStep>,
}

/// Replays every student's events into observed transitions.
///
/// The encoder is calibrated on all signals of the run before any state is
/// encoded. Durations are the gap to the student's next event capped at the
/// session cap; a student's final event gets the mean of their other gaps,
/// or [`config::DEFAULT_ACTION_DURATION_SECS`] when there are none.
pub fn build_trajectories(
    dataset: &CourseDataset,
    memberships: &BTreeMap<StudentId, usize>,
    n_clusters: usize,
    encoder_config: &EncoderConfig,
    rewards: &RewardWeights,
) -> TrajectorySet {
    let mut unmapped = 0usize;
    let mut raw = Vec::with_capacity(dataset.students.len());
    let mut max_module = 0u8;

    for student in &dataset.students {
        let cluster_id = memberships.get(&student.student_id).copied().unwrap_or_else(|| {
            warn!(
                "Course {}: student {} has no cluster membership, using cluster 0",
                dataset.course_id, student.student_id
            );
            0
        });
        let mut walker = Walker::new(student, cluster_id, encoder_config.engagement_window_days);
        let initial = walker.signals();
        let mut steps = Vec::new();
        let mut gaps = Vec::new();
        let events = &student.events;

        for (i, event) in events.iter().enumerate() {
            let module = event.module_index.unwrap_or(walker.frontier);
            max_module = max_module.max(module);
            let mapped = match ActionType::from_log_event(event) {
                Ok(a) => Some(a),
                Err(e) => {
                    debug!("Student {}: {}", student.student_id, e);
                    unmapped += 1;
                    None
                }
            };

            walker.absorb_grades(Some(event.timestamp));
            let before = walker.signals();
            let context = TemporalContext::relative(module, walker.frontier);
            walker.record_event(module, event.timestamp, mapped);
            let next_ts = events.get(i + 1).map(|e| e.timestamp);
            walker.absorb_grades(next_ts);
            let after = walker.signals();

            let gap = next_ts.map(|t| {
                ((t - event.timestamp).num_milliseconds().max(0) as f64 / 1000.0)
                    .min(encoder_config.session_cap_secs)
            });
            if let Some(g) = gap {
                gaps.push(g);
            }
            if let Some(action_type) = mapped {
                steps.push(RawStep {
                    before,
                    after,
                    action: Action::new(action_type, context),
                    duration_secs: gap.unwrap_or(f64::NAN),
                });
            }
        }

        let fill = if gaps.is_empty() {
            config::DEFAULT_ACTION_DURATION_SECS
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };
        for step in steps.iter_mut().filter(|s| s.duration_secs.is_nan()) {
            step.duration_secs = fill;
        }

        walker.absorb_grades(None);
        raw.push(RawTrajectory {
            student_id: student.student_id.clone(),
            initial,
            last: walker.signals(),
            steps,
        });
    }

    let n_modules = dataset
        .module_count
        .unwrap_or(0)
        .max(max_module.saturating_add(1));
    let mut all_signals = Vec::new();
    for t in &raw {
        all_signals.push(t.initial.clone());
        for s in &t.steps {
            all_signals.push(s.before.clone());
            all_signals.push(s.after.clone());
        }
    }
    let encoder = StateEncoder::calibrate(encoder_config, &all_signals, n_clusters, n_modules);

    let mut transitions = Vec::new();
    let mut student_states = BTreeMap::new();
    let mut start_states = Vec::with_capacity(raw.len());
    for t in raw {
        start_states.push(encoder.encode(&t.initial));
        student_states.insert(t.student_id, encoder.encode(&t.last));
        for step in t.steps {
            let state = encoder.encode(&step.before);
            let next_state = encoder.encode(&step.after);
            transitions.push(Transition {
                state,
                action: step.action,
                next_state,
                duration_secs: step.duration_secs,
                reward: rewards.reward(&state, &next_state, step.duration_secs),
            });
        }
    }

    if unmapped > 0 {
        warn!(
            "Course {}: {} events could not be mapped to an action type and were left out of trajectories",
            dataset.course_id, unmapped
        );
    }
    info!(
        "Course {}: built {} transitions from {} students over {} modules",
        dataset.course_id,
        transitions.len(),
        student_states.len(),
        n_modules
    );

    TrajectorySet {
        encoder,
        transitions,
        student_states,
        start_states,
        unmapped_events: unmapped,
    }
}
