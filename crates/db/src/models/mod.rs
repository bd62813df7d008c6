//! Domain model structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct matching
//! the database row (with the joined status name) and the `Deserialize`
//! DTOs used for inserts.

pub mod attempt;
pub mod execution;
pub mod host;
