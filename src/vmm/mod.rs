pub mod config;
pub mod context;
pub mod granularity;
pub mod memory;
pub mod topology;
