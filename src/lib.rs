//! MTLINK EA Link Server Core
//!
//! Communication backbone between a remote execution agent (EA) and the
//! central server: connection health tracking, durable command dispatch
//! with fast-path delivery, EA-wins trade reconciliation, and batched
//! tick ingestion.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
