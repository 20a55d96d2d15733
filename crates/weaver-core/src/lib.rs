//! Workflow engine and repository trait definitions for Weaver.
//!
//! This crate defines the "ports" (repository and task-executor traits) that
//! the infrastructure layer implements, plus the engine itself. It depends
//! only on `weaver-types` -- never on `weaver-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
