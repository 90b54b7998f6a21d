//! Collaborator seams and their adapters.

pub mod broadcaster;
pub mod config;
pub mod executor;
pub mod fs_store;
pub mod judge;
pub mod plan_store;
pub mod planner;
pub mod record_store;
