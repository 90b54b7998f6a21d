//! Step-by-step task execution with verification and bounded self-correction.
//!
//! A [`controller::TaskRunController`] drives a plan of steps against a live
//! target through injected collaborators. Each step is executed, its effect is
//! verified, and failures are corrected up to a per-step bound. Every attempt
//! leaves an audit record and a progress event. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict policy, failure
//!   classification, correction shaping, plan splicing, record types).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Collaborator traits and adapters (executor, judge, planner,
//!   record stores, broadcaster, plan and config files).
//!
//! Orchestration modules ([`verify`], [`correct`], [`controller`]) combine the
//! two; [`report`] renders the action history for download.

pub mod controller;
pub mod core;
pub mod correct;
pub mod io;
pub mod logging;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
