// src/analytics/ingest.rs
use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::{CourseDataset, StudentActivity, StudentId};

/// Counts of records kept and skipped while normalizing a course dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub students: usize,
    /// Records the log source could not decode
    pub malformed_records: usize,
    pub inactive_students: usize,
    pub duplicate_student_entries: usize,
    pub events_kept: usize,
    pub events_outside_window: usize,
    pub grades_kept: usize,
    pub grades_out_of_range: usize,
    pub grades_outside_window: usize,
}

impl IngestReport {
    pub fn skipped_records(&self) -> usize {
        self.malformed_records
            + self.events_outside_window
            + self.grades_out_of_range
            + self.grades_outside_window
    }
}

/// Normalizes a dataset before analysis.
///
/// Records outside the run window and grades with impossible values are
/// dropped and counted; the batch always continues. Duplicate entries for a
/// student are merged. Students with no activity are kept so they still get
/// an all-zero feature vector. Events and grades come out time-ordered and
/// students come out ordered by id, which keeps every later stage
/// deterministic.
pub fn sanitize(dataset: CourseDataset) -> (CourseDataset, IngestReport) {
    let mut report = IngestReport {
        malformed_records: dataset.malformed_records,
        ..IngestReport::default()
    };
    let window = dataset.window;
    let mut merged: BTreeMap<StudentId, StudentActivity> = BTreeMap::new();

    for student in dataset.students {
        if merged.contains_key(&student.student_id) {
            report.duplicate_student_entries += 1;
        }
        let entry = merged
            .entry(student.student_id.clone())
            .or_insert_with(|| StudentActivity {
                student_id: student.student_id.clone(),
                events: Vec::new(),
                grades: Vec::new(),
            });

        for event in student.events {
            if !window.contains(&event.timestamp) {
                report.events_outside_window += 1;
                continue;
            }
            entry.events.push(event);
        }

        for grade in student.grades {
            let valid = grade.score.is_finite()
                && grade.max_score.is_finite()
                && grade.max_score > 0.0
                && grade.score >= 0.0
                && grade.score <= grade.max_score;
            if !valid {
                debug!(
                    "Skipping out-of-range grade for {} on {}: {}/{}",
                    student.student_id, grade.item_reference, grade.score, grade.max_score
                );
                report.grades_out_of_range += 1;
                continue;
            }
            if !window.contains(&grade.timestamp) {
                report.grades_outside_window += 1;
                continue;
            }
            entry.grades.push(grade);
        }
    }

    let mut students: Vec<StudentActivity> = merged.into_values().collect();
    for student in &mut students {
        student.events.sort_by_key(|e| e.timestamp);
        student.grades.sort_by_key(|g| g.timestamp);
        report.events_kept += student.events.len();
        report.grades_kept += student.grades.len();
        if student.is_inactive() {
            report.inactive_students += 1;
        }
    }
    report.students = students.len();

    if report.skipped_records() > 0 {
        warn!(
            "Course {}: skipped {} records during ingest ({} malformed, {} events outside window, {} grades out of range, {} grades outside window)",
            dataset.course_id,
            report.skipped_records(),
            report.malformed_records,
            report.events_outside_window,
            report.grades_out_of_range,
            report.grades_outside_window
        );
    }

    (
        CourseDataset {
            course_id: dataset.course_id,
            window,
            module_count: dataset.module_count,
            students,
            malformed_records: 0,
        },
        report,
    )
}
