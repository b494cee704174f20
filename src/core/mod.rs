//! Pure, deterministic scheduling logic.
//!
//! Nothing in this module performs I/O. Given the same inputs (task set,
//! state map, clock value) every function returns the same result, which is
//! what makes the scheduler's behavior reproducible under test.

pub mod outcome;
pub mod recovery;
pub mod retry;
pub mod selector;
pub mod state;
pub mod task;
