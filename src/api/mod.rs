//! HTTP API Module
//!
//! Job control and status over REST. The `wolfmigrate` CLI talks to it.

mod http;

pub use http::{AckResponse, ErrorResponse, HttpServer, StartResponse};
