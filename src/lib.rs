pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod eventlog;
pub mod export;
pub mod ship;
