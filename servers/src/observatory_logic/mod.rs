pub mod api;
pub mod config;
pub mod logger;
pub mod state;
pub mod upstream;
