// src/analytics/mod.rs
pub mod clustering;
pub mod features;
pub mod ingest;
pub mod stats;
