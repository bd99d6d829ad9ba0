pub mod check;
pub mod config;
pub mod counters;
pub mod import;
pub mod names;
pub mod profile;
pub mod sessions;
pub mod store;

/// Application name for XDG paths
pub const APP_NAME: &str = "listenlog";
