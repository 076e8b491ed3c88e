//! Helpers for processing the incoming request.

pub mod body;
pub mod path;
pub mod query_string;
