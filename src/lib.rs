pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod ssh;
pub mod utils;
