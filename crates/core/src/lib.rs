//! Rigger core domain logic.
//!
//! Everything in this crate is free of database access: script rendering,
//! subprocess execution, stdout extraction, metadata-bag semantics, audit
//! note formatting, and the workflow projection. The `db`, `pipeline`,
//! `worker` and `api` crates build on these pieces.

pub mod channels;
pub mod entity;
pub mod error;
pub mod extractor;
pub mod metadata;
pub mod notes;
pub mod pipelines;
pub mod scripting;
pub mod scripts;
pub mod status;
pub mod types;
pub mod workflow;
