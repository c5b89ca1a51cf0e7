// src/lib.rs
pub mod analytics;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod reinforcement;
pub mod results;
pub mod storage;
pub mod utils;
