//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weaver-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` is the in-process implementation used by
//! tests and `--memory` runs.

pub mod memory;
pub mod workflow;
