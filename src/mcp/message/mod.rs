//! Message building utilities for MCP responses.
//!
//! Builders for the short human-readable summaries returned next to the
//! structured tool results.

mod builder;

pub use builder::{ExecuteMessageBuilder, SessionMessageBuilder};
