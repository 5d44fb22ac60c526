//! FilterChat Library
//!
//! Conversational text generation over interchangeable local backends, with
//! an optional safety gate in front of the reply.

pub mod config;
pub mod inference;
pub mod safety;
pub mod types;
