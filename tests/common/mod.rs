// tests/common/mod.rs
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};

use pathwise_lib::config::EngineConfig;
use pathwise_lib::models::{CourseDataset, CourseId, GradeRecord, LogEvent, RunWindow, StudentActivity};

pub const MODULES: u8 = 4;

pub fn window_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

pub fn window() -> RunWindow {
    RunWindow::trailing(window_end(), 28)
}

pub fn event(name: &str, verb: &str, object: &str, module: u8, ts: DateTime<Utc>) -> LogEvent {
    LogEvent {
        event_name: name.to_string(),
        action: verb.to_string(),
        object_reference: Some(object.to_string()),
        module_index: Some(module),
        timestamp: ts,
    }
}

fn grade(item: &str, module: u8, score: f64, ts: DateTime<Utc>) -> GradeRecord {
    GradeRecord {
        item_reference: item.to_string(),
        module_index: Some(module),
        score,
        max_score: 10.0,
        timestamp: ts,
    }
}

/// Student `i` of a synthetic course. Students fall into three behavior
/// groups by `i % 3`: quiz-driven, forum-driven and view-only.
pub fn student(i: usize) -> StudentActivity {
    let mut s = StudentActivity::new(format!("s{:03}", i));
    let start = window().start + Duration::hours(9);
    for m in 0..MODULES {
        // Stays inside one clock hour so time histograms only differ by group
        let day = start + Duration::days(m as i64 * 6) + Duration::minutes((i / 3 % 5) as i64);
        let at = |minutes: i64| day + Duration::minutes(minutes);
        let quiz = format!("quiz:{}", m);
        match i % 3 {
            0 => {
                s.events.push(event("course_module_viewed", "viewed", &format!("resource:{}", m), m, at(0)));
                s.events.push(event("attempt_started", "started", &quiz, m, at(15)));
                s.events.push(event("attempt_submitted", "submitted", &quiz, m, at(40)));
                s.events.push(event("attempt_reviewed", "reviewed", &quiz, m, at(50)));
                s.events.push(event("course_module_viewed", "viewed", &format!("resource:{}", m), m, at(70)));
                s.grades.push(grade(&quiz, m, 8.5 + (i % 4) as f64 * 0.4, at(41)));
            }
            1 => {
                s.events.push(event("course_module_viewed", "viewed", &format!("forum:{}", m), m, at(0)));
                s.events.push(event("post_created", "created", &format!("forum:{}", m), m, at(20)));
                s.events.push(event("post_created", "created", &format!("forum:{}", m), m, at(45)));
                s.events.push(event("discussion_created", "created", &format!("forum:{}", m), m, at(90)));
                s.events.push(event("submission_created", "created", &format!("assign:{}", m), m, at(180)));
                s.grades.push(grade(&format!("assign:{}", m), m, 6.0 + (i % 3) as f64 * 0.3, at(181)));
            }
            _ => {
                s.events.push(event("course_module_viewed", "viewed", &format!("resource:{}", m), m, at(0)));
                if m % 2 == 0 {
                    s.events.push(event("resource_viewed", "viewed", &format!("resource:{}", m), m, at(5)));
                }
            }
        }
    }
    s
}

pub fn synthetic_course(course: &str, n_students: usize) -> CourseDataset {
    CourseDataset {
        course_id: CourseId(course.to_string()),
        window: window(),
        module_count: Some(MODULES),
        students: (0..n_students).map(student).collect(),
        malformed_records: 0,
    }
}

/// Defaults with a shorter training schedule.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.clustering.k_max = 5;
    config.trainer.max_episodes = 600;
    config.trainer.min_episodes = 100;
    config.scheduler.retry.initial_backoff_ms = 1;
    config.scheduler.retry.max_backoff_ms = 4;
    config.scheduler.retry.jitter = false;
    config
}
