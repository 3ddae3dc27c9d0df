//! proctor-core: Timed multi-section exam attempt engine.
//!
//! This crate owns the attempt document while a learner works through a
//! test: the tick clock, per-section timers, the answer store, the attempt
//! state machine, and the sync and submission layers that talk to the
//! persistence and grading boundaries defined in [`traits`].

pub mod answers;
pub mod clock;
pub mod error;
pub mod machine;
pub mod model;
pub mod parser;
pub mod report;
pub mod session;
pub mod submission;
pub mod sync;
pub mod timer;
pub mod traits;
