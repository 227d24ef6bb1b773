//! Root of the `herd-core` library.
//!
//! Supervises a fleet of long-running worker processes: spawns them, derives
//! their session state from their output, talks to them over a private Unix
//! socket and keeps a registry of what is alive or recently dead.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the front end.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod boundary;
pub mod classifier;
pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod log_tail;
pub mod process;
mod process_death;
pub mod registry;
pub mod scratch;
pub mod supervisor;

pub use boundary::handle_request;
pub use classifier::DeathCause;
pub use classifier::LineClassifier;
pub use classifier::SessionMachine;
pub use classifier::TextLogClassifier;
pub use config::HerdConfig;
pub use config::WorkerConfig;
pub use error::HerdErr;
pub use error::Result;
pub use registry::InstanceRegistry;
pub use supervisor::Instance;
