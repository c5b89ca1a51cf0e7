// src/analytics/features/extractor.rs
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{FeatureMatrix, SelectionReport, StandardScaler};
use crate::config;
use crate::models::{CourseDataset, StudentActivity, StudentId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Emit event x action co-occurrence columns
    pub include_cooccurrence: bool,
    /// Emit hour-of-day and day-of-week histograms
    pub include_time_histograms: bool,
    /// Emit grade mean / grade count columns
    pub include_grades: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            include_cooccurrence: true,
            include_time_histograms: true,
            include_grades: true,
        }
    }
}

/// Per-student features of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub student_id: StudentId,
    /// Raw window-normalized values
    pub values: BTreeMap<String, f64>,
    /// Z-scores against the whole course, same keys as `values`
    #[serde(default)]
    pub scaled: BTreeMap<String, f64>,
    /// Columns retained by feature selection, in clustering order
    #[serde(default)]
    pub selected: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl FeatureVector {
    pub fn is_all_zero(&self) -> bool {
        self.values.values().all(|v| *v == 0.0)
    }

    /// Scaled values of the selected columns, in selection order. This is the
    /// row the clustering stage sees for this student.
    pub fn selected_scaled(&self) -> Vec<f64> {
        self.selected
            .iter()
            .map(|name| self.scaled.get(name).copied().unwrap_or(0.0))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub matrix: FeatureMatrix,
    pub vectors: Vec<FeatureVector>,
    /// Mean normalized grade per student, row-aligned with `matrix`. Used as
    /// the label proxy for feature importance.
    pub label_proxy: Vec<f64>,
}

impl ExtractionOutput {
    /// Records the selector's retained columns on every vector.
    pub fn apply_selection(&mut self, selection: &SelectionReport) {
        for vector in &mut self.vectors {
            vector.selected = selection.retained.clone();
        }
    }
}

/// Turns raw logs and grades into a students x features matrix.
///
/// Column set is the union of event names and actions seen anywhere in the
/// course, sorted, so all students share identical columns. Counts are
/// divided by the window length in days; time histograms are fractions of
/// the student's own events.
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn extract(&self, dataset: &CourseDataset, computed_at: DateTime<Utc>) -> ExtractionOutput {
        let columns = self.column_names(dataset);
        let column_index: BTreeMap<&str, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let window_days = dataset.window.days();

        let mut rows = Vec::with_capacity(dataset.students.len());
        let mut label_proxy = Vec::with_capacity(dataset.students.len());
        for student in &dataset.students {
            rows.push(self.student_row(student, &column_index, columns.len(), window_days));
            label_proxy.push(mean_grade(student));
        }
        let matrix = FeatureMatrix {
            student_ids: dataset.students.iter().map(|s| s.student_id.clone()).collect(),
            feature_names: columns,
            rows,
        };

        let scaler = StandardScaler::fit(&matrix);
        let vectors: Vec<FeatureVector> = matrix
            .student_ids
            .iter()
            .zip(&matrix.rows)
            .map(|(student_id, row)| FeatureVector {
                student_id: student_id.clone(),
                values: named(&matrix.feature_names, row),
                scaled: named(&matrix.feature_names, &scaler.transform_row(row)),
                selected: Vec::new(),
                computed_at,
            })
            .collect();

        let zero_rows = vectors.iter().filter(|v| v.is_all_zero()).count();
        info!(
            "Course {}: extracted {} features for {} students ({} with no activity)",
            dataset.course_id,
            matrix.n_cols(),
            matrix.n_rows(),
            zero_rows
        );

        ExtractionOutput {
            matrix,
            vectors,
            label_proxy,
        }
    }

    fn column_names(&self, dataset: &CourseDataset) -> Vec<String> {
        let mut events = BTreeSet::new();
        let mut actions = BTreeSet::new();
        let mut pairs = BTreeSet::new();
        for student in &dataset.students {
            for event in &student.events {
                let e = normalize_token(&event.event_name);
                let a = normalize_token(&event.action);
                pairs.insert(format!("{}|{}", e, a));
                events.insert(e);
                actions.insert(a);
            }
        }

        let mut columns: Vec<String> = Vec::new();
        columns.extend(events.iter().map(|e| format!("event:{}", e)));
        columns.extend(actions.iter().map(|a| format!("action:{}", a)));
        if self.config.include_cooccurrence {
            columns.extend(pairs.iter().map(|p| format!("event_action:{}", p)));
        }
        if self.config.include_time_histograms {
            columns.extend((0..24).map(|h| format!("hour:{:02}", h)));
            columns.extend((0..7).map(|d| format!("weekday:{}", d)));
        }
        if self.config.include_grades {
            columns.push(config::FEATURE_GRADE_MEAN.to_string());
            columns.push(config::FEATURE_GRADE_COUNT.to_string());
        }
        debug!(
            "Feature columns: {} events, {} actions, {} pairs",
            events.len(),
            actions.len(),
            pairs.len()
        );
        columns
    }

    fn student_row(
        &self,
        student: &StudentActivity,
        column_index: &BTreeMap<&str, usize>,
        width: usize,
        window_days: f64,
    ) -> Vec<f64> {
        let mut row = vec![0.0; width];
        let mut bump = |name: &str, amount: f64| {
            if let Some(&idx) = column_index.get(name) {
                row[idx] += amount;
            }
        };

        let per_day = 1.0 / window_days;
        let total_events = student.events.len();
        let per_event = if total_events > 0 {
            1.0 / total_events as f64
        } else {
            0.0
        };

        for event in &student.events {
            let e = normalize_token(&event.event_name);
            let a = normalize_token(&event.action);
            bump(&format!("event:{}", e), per_day);
            bump(&format!("action:{}", a), per_day);
            if self.config.include_cooccurrence {
                bump(&format!("event_action:{}|{}", e, a), per_day);
            }
            if self.config.include_time_histograms {
                bump(&format!("hour:{:02}", event.timestamp.hour()), per_event);
                bump(
                    &format!("weekday:{}", event.timestamp.weekday().num_days_from_monday()),
                    per_event,
                );
            }
        }

        if self.config.include_grades {
            bump(config::FEATURE_GRADE_MEAN, mean_grade(student));
            bump(config::FEATURE_GRADE_COUNT, student.grades.len() as f64 * per_day);
        }
        row
    }
}

fn named(names: &[String], row: &[f64]) -> BTreeMap<String, f64> {
    names.iter().cloned().zip(row.iter().copied()).collect()
}

fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', ':'], "_")
}

fn mean_grade(student: &StudentActivity) -> f64 {
    if student.grades.is_empty() {
        return 0.0;
    }
    student.grades.iter().map(|g| g.normalized()).sum::<f64>() / student.grades.len() as f64
}
