//! AutoMentor Core
//!
//! Planning-and-memory core of a proactive learning mentor:
//! - Long-term memory with similarity recall
//! - SMART goal setting with clarifying questions
//! - Task planning (linear, parallel, milestone)
//! - Reflection with corrective replanning
//! - Scheduled triggers and tool dispatch

pub mod agent;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod storage;

pub use agent::*;
pub use capabilities::*;
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use runtime::{AgentRuntime, Capabilities};
pub use scheduler::OrchestratorLoop;
pub use state::{StateRegistry, UserState};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
