pub mod circuit_breaker;
pub mod command_dispatcher;
pub mod connection_registry;
pub mod reconciliation;
pub mod tick_pipeline;
