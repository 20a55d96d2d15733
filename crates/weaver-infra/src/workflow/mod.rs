//! Workflow adapters.
//!
//! - `builtin` -- the task executors registered by the `weaver` CLI

pub mod builtin;
