//! Persistent run state.
//!
//! After every task transition the orchestrator can hand a complete
//! [`RunSnapshot`] to a [`SnapshotStore`], which is enough to resume the run
//! after an interruption.

mod store;

pub use store::{RunSnapshot, SnapshotStore};
