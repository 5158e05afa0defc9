//! Fake SQL Server Library
//!
//! Presents a MySQL endpoint to database GUI clients and runs every query
//! through the `runops` CLI, re-encoding its output as MySQL result sets.

pub mod config;
pub mod error;
pub mod executor;
pub mod schema;
pub mod server;

pub use config::{Config, TargetConfig};
pub use error::{ProxyError, ProxyResult};
pub use server::MysqlProxyServer;
