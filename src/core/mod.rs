pub mod config;
pub mod entry;
pub mod error;
pub mod paths;
