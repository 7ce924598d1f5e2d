//! Capability execution and audit engine.
//!
//! Runs curated maintenance operations declared in a capability catalog,
//! across a user tier and an elevated tier reached through a separate
//! helper process, and records every attempt in a hash-chained audit log.

pub mod audit;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod helper;
pub mod parser;
pub mod permissions;
pub mod preflight;
pub mod runner;
pub mod util;
pub mod version;

pub use engine::{Engine, EngineServices};
pub use error::{EngineError, EngineResult};
pub use executor::ExecutionResult;
