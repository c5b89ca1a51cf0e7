// src/models.rs

use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{IsNull, ToSql, Type};

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Newtypes keep student and course identifiers from being mixed up

/// Strongly typed identifier for a student (LMS user id as text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudentId(pub String);

/// Strongly typed identifier for a course
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CourseId(pub String);

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// CourseId is written straight into TEXT columns by the Postgres snapshot store
impl ToSql for CourseId {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql_checked(ty, out)
    }
}

impl ToSql for StudentId {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql_checked(ty, out)
    }
}

//------------------------------------------------------------------------------
// RAW ACTIVITY
//------------------------------------------------------------------------------

/// One normalized LMS log record for a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// LMS event name, e.g. `course_module_viewed`
    pub event_name: String,

    /// Verb recorded by the LMS, e.g. `viewed`, `submitted`
    pub action: String,

    /// Object the event refers to (`resource:12`, `quiz:4`, ...)
    #[serde(default)]
    pub object_reference: Option<String>,

    /// Course section the object belongs to, when the LMS knows it
    #[serde(default)]
    pub module_index: Option<u8>,

    pub timestamp: DateTime<Utc>,
}

/// A graded item for a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub item_reference: String,

    #[serde(default)]
    pub module_index: Option<u8>,

    pub score: f64,
    pub max_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl GradeRecord {
    /// Score scaled to [0, 1].
    pub fn normalized(&self) -> f64 {
        if self.max_score <= 0.0 {
            return 0.0;
        }
        (self.score / self.max_score).clamp(0.0, 1.0)
    }
}

/// All activity of one student inside the analysis window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentActivity {
    pub student_id: StudentId,

    #[serde(default)]
    pub events: Vec<LogEvent>,

    #[serde(default)]
    pub grades: Vec<GradeRecord>,
}

impl StudentActivity {
    pub fn new(student_id: impl Into<String>) -> Self {
        Self {
            student_id: StudentId(student_id.into()),
            events: Vec::new(),
            grades: Vec::new(),
        }
    }

    pub fn is_inactive(&self) -> bool {
        self.events.is_empty() && self.grades.is_empty()
    }
}

/// Sliding log window a run is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RunWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending at `end` and reaching back `days` days.
    pub fn trailing(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts <= self.end
    }

    /// Length of the window in days, never below one day.
    pub fn days(&self) -> f64 {
        let secs = (self.end - self.start).num_seconds().max(0) as f64;
        (secs / 86_400.0).max(1.0)
    }

    /// Stable key used for run idempotency.
    pub fn key(&self) -> String {
        format!("{}..{}", self.start.timestamp(), self.end.timestamp())
    }
}

/// Normalized in-memory input for one course run, as supplied by the log source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseDataset {
    pub course_id: CourseId,
    pub window: RunWindow,

    /// Number of modules (sections) of the course
    #[serde(default)]
    pub module_count: Option<u8>,

    pub students: Vec<StudentActivity>,

    /// Records the source dropped because they could not be decoded
    #[serde(default)]
    pub malformed_records: usize,
}

impl CourseDataset {
    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    pub fn event_count(&self) -> usize {
        self.students.iter().map(|s| s.events.len()).sum()
    }
}
