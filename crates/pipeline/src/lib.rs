//! Job-chain orchestration.
//!
//! A [`Chain`](runner::Chain) is a fixed list of [`Step`](step::Step)s run
//! in order against one host or work attempt. Each step renders one script,
//! runs it through a [`ScriptExecutor`](rigger_core::scripting::executor::ScriptExecutor),
//! finalises one execution record, and moves the entity's workflow forward in
//! its metadata bag. The first failing step halts the chain.
//!
//! Storage is reached through the [`EntityStore`](store::EntityStore) and
//! [`ExecutionStore`](store::ExecutionStore) traits: [`PgStore`](pg::PgStore)
//! in production, [`MemoryStore`](memory::MemoryStore) in tests.

pub mod audit;
pub mod chains;
pub mod context;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod runner;
pub mod step;
pub mod store;
pub mod tracker;

pub use error::{PipelineError, PipelineResult};
pub use runner::{Chain, ChainOutcome, ChainReport, ChainRunner, ChainStep, StepPolicy};
