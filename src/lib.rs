pub mod auth;
pub mod cache;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod report;
pub mod service;
pub mod session;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
