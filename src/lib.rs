//! Implements the featureflagshq client
//!
//! Flags are evaluated against a locally cached snapshot of definitions,
//! refreshed by a background task. Evaluation calls never touch the
//! network and never fail; they fall back to the caller-supplied default.
//!
//! Reference: https://docs.featureflagshq.com/http-api
mod breaker;
mod client;
mod evaluator;
mod http;
mod limiter;
mod stats;

pub mod models;

pub use crate::breaker::BreakerState;
pub use crate::client::Client;
pub use crate::evaluator::models::{EvalReason, FlagValue};
pub use crate::evaluator::SegmentMap;
