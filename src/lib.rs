pub mod app_cache;
pub mod cli;
pub mod context;
pub mod error;
pub mod expiring_cache;
pub mod funnel;
pub mod http;
pub mod jobs;
pub mod logging;
pub mod memo;
pub mod platform;
pub mod roles;
pub mod settings;
