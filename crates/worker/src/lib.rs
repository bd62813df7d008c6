//! Background worker: claims pending hosts, work attempts and queued
//! scripts, and runs their chains.

pub mod config;
pub mod dispatcher;
pub mod locks;
