pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod processor;
pub mod relay;
