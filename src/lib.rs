pub mod app;
pub mod builder;
pub mod config;
pub mod console;
pub mod env;
pub mod errors;
pub mod init;
pub mod loader;
pub mod log_store;
pub mod logging;
pub mod runner;
pub mod settings;
pub mod store;
pub mod webhook;
