//! Event bus for workflow run progress.
//!
//! `EventBus` distributes `WorkflowEvent`s to every subscriber; `RunEvents`
//! narrows a subscription to one run.

pub mod bus;

pub use bus::{EventBus, RunEvents};
