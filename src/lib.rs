//! deepbrief: evidence store, hybrid retrieval, and versioned publication
//! for research runs.
//!
//! A run collects sources, ingests them into contextualized chunks, answers
//! hybrid (vector + keyword) search over its own evidence, resolves drafted
//! citations into numbered references, and publishes immutable document
//! versions with change logs. Every stage transition is evented and
//! checkpointed so runs survive crashes.

pub mod chunk;
pub mod citation;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod search;
pub mod store;
pub mod version;
