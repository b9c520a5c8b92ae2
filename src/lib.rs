//! FastCGI gateway library.
//!
//! A FastCGI client (records, pooled keep-alive connections, responder
//! requests) and an HTTP front end that forwards requests to a FastCGI
//! application server such as PHP-FPM.

pub mod admin;
pub mod config;
pub mod fastcgi;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use config::GatewayConfig;
pub use fastcgi::{Client, FcgiError, FcgiResponse, Pool, PoolRegistry, Request, Transport};
pub use http::GatewayServer;
pub use lifecycle::{Gateway, Shutdown};
