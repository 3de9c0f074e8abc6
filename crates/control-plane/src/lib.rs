pub mod api;
pub mod auth;
pub mod change_bus;
pub mod config;
pub mod crypto;
pub mod db;
pub mod deployment;
pub mod docker;
pub mod error;
pub mod extension;
pub mod healthcheck;
pub mod host;
pub mod jobs;
pub mod live_sync;
pub mod proxy;
pub mod realtime;
pub mod repository;
mod request_logging;
pub mod server;
pub mod telemetry;

#[cfg(test)]
pub mod testing;
