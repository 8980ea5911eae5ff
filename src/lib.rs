pub mod api;
pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod plugins;
