// src/reinforcement/types.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AnalyticsError;
use crate::models::LogEvent;

/// Recommendable activity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ViewContent,
    ViewAssignment,
    AttemptQuiz,
    SubmitQuiz,
    ReviewQuiz,
    SubmitAssignment,
    PostForum,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::ViewContent,
        ActionType::ViewAssignment,
        ActionType::AttemptQuiz,
        ActionType::SubmitQuiz,
        ActionType::ReviewQuiz,
        ActionType::SubmitAssignment,
        ActionType::PostForum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ViewContent => "view_content",
            ActionType::ViewAssignment => "view_assignment",
            ActionType::AttemptQuiz => "attempt_quiz",
            ActionType::SubmitQuiz => "submit_quiz",
            ActionType::ReviewQuiz => "review_quiz",
            ActionType::SubmitAssignment => "submit_assignment",
            ActionType::PostForum => "post_forum",
        }
    }

    /// Learning phase a student is in right after performing this action.
    pub fn phase(&self) -> LearningPhase {
        match self {
            ActionType::ViewContent | ActionType::ViewAssignment => LearningPhase::PreLearning,
            ActionType::AttemptQuiz | ActionType::SubmitQuiz | ActionType::SubmitAssignment => {
                LearningPhase::ActiveLearning
            }
            ActionType::ReviewQuiz | ActionType::PostForum => LearningPhase::ReflectiveLearning,
        }
    }

    /// Whether the action normally produces a grade.
    pub fn is_graded(&self) -> bool {
        matches!(self, ActionType::SubmitQuiz | ActionType::SubmitAssignment)
    }

    /// Maps a raw LMS event onto an action type.
    ///
    /// Event names may carry a component prefix (`\mod_quiz\event\attempt_started`);
    /// only the last path segment is matched.
    pub fn from_log_event(event: &LogEvent) -> Result<ActionType, AnalyticsError> {
        let name = event
            .event_name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let object_kind = event
            .object_reference
            .as_deref()
            .and_then(|r| r.split(':').next())
            .map(|k| k.trim().to_ascii_lowercase());

        let mapped = match name.as_str() {
            "course_module_viewed" => match object_kind.as_deref() {
                Some("assign") | Some("assignment") => ActionType::ViewAssignment,
                _ => ActionType::ViewContent,
            },
            "resource_viewed" | "page_viewed" | "url_viewed" => ActionType::ViewContent,
            "submission_status_viewed" => ActionType::ViewAssignment,
            "attempt_started" | "attempt_viewed" => ActionType::AttemptQuiz,
            "attempt_submitted" => ActionType::SubmitQuiz,
            "attempt_reviewed" | "attempt_summary_viewed" => ActionType::ReviewQuiz,
            "assessable_submitted" | "submission_created" | "submission_updated" => {
                ActionType::SubmitAssignment
            }
            "post_created" | "discussion_created" => ActionType::PostForum,
            _ => {
                return Err(AnalyticsError::malformed(format!(
                    "unmapped event '{}' ({})",
                    event.event_name, event.action
                )));
            }
        };
        Ok(mapped)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| AnalyticsError::UnknownAction(s.to_string()))
    }
}

/// Module an action targets, relative to the student's current module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalContext {
    Past,
    Current,
    Future,
}

impl TemporalContext {
    pub const ALL: [TemporalContext; 3] = [
        TemporalContext::Past,
        TemporalContext::Current,
        TemporalContext::Future,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalContext::Past => "past",
            TemporalContext::Current => "current",
            TemporalContext::Future => "future",
        }
    }

    /// Context of an event on `module` for a student whose frontier is `current`.
    pub fn relative(module: u8, current: u8) -> Self {
        match module.cmp(&current) {
            std::cmp::Ordering::Less => TemporalContext::Past,
            std::cmp::Ordering::Equal => TemporalContext::Current,
            std::cmp::Ordering::Greater => TemporalContext::Future,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningPhase {
    PreLearning,
    ActiveLearning,
    ReflectiveLearning,
}

impl LearningPhase {
    pub const COUNT: u8 = 3;

    pub fn code(&self) -> u8 {
        match self {
            LearningPhase::PreLearning => 0,
            LearningPhase::ActiveLearning => 1,
            LearningPhase::ReflectiveLearning => 2,
        }
    }
}

/// Recommendable (action type, temporal context) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub context: TemporalContext,
}

impl Action {
    pub fn new(action_type: ActionType, context: TemporalContext) -> Self {
        Self {
            action_type,
            context,
        }
    }

    /// Stable key, e.g. `attempt_quiz@current`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.action_type.as_str(), self.context.as_str())
    }

    pub fn label(&self) -> String {
        let what = match self.action_type {
            ActionType::ViewContent => "Study content",
            ActionType::ViewAssignment => "Read the assignment",
            ActionType::AttemptQuiz => "Attempt the quiz",
            ActionType::SubmitQuiz => "Submit the quiz",
            ActionType::ReviewQuiz => "Review quiz feedback",
            ActionType::SubmitAssignment => "Submit the assignment",
            ActionType::PostForum => "Post in the forum",
        };
        let when = match self.context {
            TemporalContext::Past => "of an earlier module",
            TemporalContext::Current => "of the current module",
            TemporalContext::Future => "of the next module",
        };
        format!("{} {}", what, when)
    }

    pub fn description(&self) -> String {
        let base = match self.action_type {
            ActionType::ViewContent => "Open lesson material and resources",
            ActionType::ViewAssignment => "Go through the assignment brief and its requirements",
            ActionType::AttemptQuiz => "Start a quiz attempt to practice",
            ActionType::SubmitQuiz => "Finish and submit an open quiz attempt",
            ActionType::ReviewQuiz => "Go over a finished attempt and its feedback",
            ActionType::SubmitAssignment => "Hand in work for the assignment",
            ActionType::PostForum => "Ask or answer a question in the discussion forum",
        };
        match self.context {
            TemporalContext::Past => format!("{} (revisit)", base),
            TemporalContext::Current => base.to_string(),
            TemporalContext::Future => format!("{} (look ahead)", base),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.action_type, self.context.as_str())
    }
}

/// Discrete learning situation of a student. Every field is a small code
/// bounded by the matching `StateDims` field.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LearningState {
    pub cluster_id: u8,
    pub module_index: u8,
    pub progress_bin: u8,
    pub score_bin: u8,
    pub learning_phase: u8,
    pub engagement_level: u8,
}

impl fmt::Display for LearningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(c{} m{} p{} s{} ph{} e{})",
            self.cluster_id,
            self.module_index,
            self.progress_bin,
            self.score_bin,
            self.learning_phase,
            self.engagement_level
        )
    }
}

/// Cardinality of every state dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDims {
    pub clusters: u8,
    pub modules: u8,
    pub progress_bins: u8,
    pub score_bins: u8,
    pub phases: u8,
    pub engagement_levels: u8,
}

impl StateDims {
    pub fn size(&self) -> usize {
        [
            self.clusters,
            self.modules,
            self.progress_bins,
            self.score_bins,
            self.phases,
            self.engagement_levels,
        ]
        .iter()
        .map(|d| *d as usize)
        .product()
    }

    pub fn contains(&self, state: &LearningState) -> bool {
        state.cluster_id < self.clusters
            && state.module_index < self.modules
            && state.progress_bin < self.progress_bins
            && state.score_bin < self.score_bins
            && state.learning_phase < self.phases
            && state.engagement_level < self.engagement_levels
    }

    pub fn last_module(&self) -> u8 {
        self.modules.saturating_sub(1)
    }
}

/// One step of a trajectory, observed or simulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: LearningState,
    pub action: Action,
    pub next_state: LearningState,
    pub duration_secs: f64,
    pub reward: f64,
}
