//! Script execution engine.
//!
//! Wraps rendered script text in a fixed preamble, runs it as a `bash`
//! child process (staged through a temp file or streamed over stdin, locally
//! or over SSH), and returns the captured result. All subprocess management
//! is pure (no DB access) and lives in the `core` crate for isolation and
//! testability.

pub mod executor;
pub mod shell;
pub mod subprocess;
pub mod target;
