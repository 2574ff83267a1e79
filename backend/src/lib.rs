//! AutoMentor Backend
//!
//! HTTP surface over the mentor runtime:
//! - Memory storage and recall
//! - Collaborative SMART goals and task plans
//! - Reflections and scheduled triggers

pub mod api;
pub mod error;

pub use api::*;
pub use error::ApiError;
