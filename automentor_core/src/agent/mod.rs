//! Agent Module - planning and memory core
//!
//! Architecture:
//! - Memory: vector-indexed long-term memory with decay and recall
//! - Goals: collaborative SMART goal setting
//! - Planner: goal decomposition into dependency-ordered tasks
//! - Reflection: periodic progress evaluation and corrective replanning
//! - Orchestrator: scheduled triggers and tool dispatch

pub mod goals;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod recall;
pub mod reflection;
pub mod smart;
pub mod types;

pub use goals::*;
pub use memory::*;
pub use orchestrator::*;
pub use planner::*;
pub use recall::*;
pub use reflection::*;
pub use smart::*;
pub use types::*;
