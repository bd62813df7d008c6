//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` (or `&mut PgConnection` inside a transaction) as the
//! first argument.

pub mod attempt_repo;
pub mod entity_state_repo;
pub mod execution_record_repo;
pub mod host_repo;

pub use attempt_repo::WorkAttemptRepo;
pub use entity_state_repo::{EntityStateRepo, StateTable};
pub use execution_record_repo::ExecutionRecordRepo;
pub use host_repo::HostRepo;
