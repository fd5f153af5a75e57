//! Time-sliced package streaming.
//!
//! - [`AsyncPackage`] - One package load, resumable across ticks
//! - [`AsyncPackageQueue`] - FIFO of requested packages driven by a frame budget

mod package;
mod queue;

pub use package::{AsyncPackage, AsyncPhase, CompletionCallback};
pub use queue::AsyncPackageQueue;
