#![forbid(unsafe_code)]

//! `recac`: fleet manager for autonomous coding agents.
//!
//! Runs agents as detached local sessions with git checkpoints, or
//! dispatches work items from a task source to containers and cluster jobs.

pub mod agent;
pub mod config;
pub mod errors;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod tasks;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
