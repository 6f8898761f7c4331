//! Arbor: a scheduler for recursive trees of coding agents.
//!
//! A root task spawns specialized children, each on its own git branch,
//! with at most one running child per parent. The crate owns admission,
//! the per-node phase machine, branch creation and merge-back, and cost
//! rollup; the agents themselves run in an external engine.

pub mod config;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod tree;
pub mod util;

pub use config::Config;
pub use error::{AdmissionError, Error, Result, TransitionError};
pub use orchestration::{Orchestrator, OrchestratorBuilder};
pub use tree::{AgentNode, Cost, NodeId, NodeStatus, Phase, Specialization};
