//! Infrastructure layer for Weaver.
//!
//! Contains implementations of the ports defined in `weaver-core`: SQLite
//! storage for execution and approval records, the `config.toml` loader,
//! data-directory resolution, and the built-in task executors the CLI
//! registers.

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod workflow;
