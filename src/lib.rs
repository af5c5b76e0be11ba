//! Profile RPA: job queue and execution engine for browser-profile automation.

pub mod config;
pub mod engine;
pub mod error;
pub mod task;
