//! # acore-core
//!
//! Core library for the acore sandboxed validation engine.
//!
//! This crate holds everything that is shared between the validation
//! service, the host-side sandbox runner, and the in-guest evaluator:
//!
//! - **Task model**: task specs and the closed set of invariant kinds
//! - **State document**: an arena-backed value tree parsed from a
//!   provider state file, with typed accessors
//! - **Evaluator**: pure, deterministic invariant evaluation producing
//!   an all-pass-or-fail verdict
//! - **Ingestion**: defensive archive extraction and workspace
//!   sanitization
//! - **Redaction**: token scrubbing applied before anything is logged
//!   or persisted
//! - **Atomic file I/O**: temp-file + rename writes so results and job
//!   records are never observed half-written

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod evaluate;
pub mod fs_safe;
pub mod redact;
pub mod report;
pub mod sanitize;
pub mod state;
pub mod task;

pub use evaluate::evaluate;
pub use redact::SecretRedactor;
pub use report::{InvariantOutcome, Verdict, VerdictStatus};
pub use state::StateDoc;
pub use task::{Invariant, InvariantKind, TaskSpec};
