pub mod app;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod presence;
pub mod provider;
pub mod relay;
pub mod session;
pub mod store;
pub mod version;
