pub mod command;
pub mod connection;
pub mod tick;
pub mod trade;
