//! Shared domain types for Weaver.
//!
//! This crate contains the workflow definition format, execution records,
//! approval records, engine events, engine configuration and the repository
//! error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
