//! Kernel execution core for script sessions.
//!
//! This crate holds the pieces of script execution that do not need a
//! runtime: splitting a script into code units, converting kernel output
//! into display items, and the pure state machine that drives one script
//! through a kernel unit by unit.
//!
//! # Features
//!
//! - [`Splitter`] trait with a [`PythonSplitter`] implementation
//! - Line-range selection over split units
//! - MIME-bundle to [`OutputItem`] conversion with ANSI stripping
//! - [`KernelStateMachine`]: `(state, input) -> (state, actions)` with no I/O

mod event;
mod machine;
mod message;
mod output;
mod splitter;
mod unit;

pub use event::{ClientEvent, UnitResult};
pub use machine::{
    transition, Action, ActiveRun, ErrorPolicy, ExecutionState, Input, KernelStateMachine,
    LossReason,
};
pub use message::{KernelActivity, KernelMessage, MimeBundle};
pub use output::{
    append_stream, error_output, extend_output, from_mime_bundle, strip_ansi, OutputItem,
};
pub use splitter::{PythonSplitter, Splitter, SyntaxError};
pub use unit::{select_units, CodeUnit, LineRange, UnitKind, UnitRef};
