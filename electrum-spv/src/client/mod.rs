//! Client-level configuration.

pub mod config;

pub use config::ClientConfig;
