//! HTTP API Module
//!
//! Provides a REST API over a running node.

mod http;

pub use http::{AckResponse, HttpServer};
