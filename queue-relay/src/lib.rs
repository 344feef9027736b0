pub mod config;
pub mod extractor;
pub mod listener;
pub mod server;
pub mod sinks;
pub mod source;
pub mod strategy;
pub mod worker;
