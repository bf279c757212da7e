//! Consume job messages from the broker and run typed handlers with
//! retries, status materialization, and result storage.

pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod llm;
pub mod registry;
pub mod tracker;
pub mod worker;
