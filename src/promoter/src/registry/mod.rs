//! Registry access: typed subprocess commands and the registry CLI client.

pub mod client;
pub mod command;
