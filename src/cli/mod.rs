//! Command-line interface for issuing requests and checking TLS configuration

pub mod request;
pub mod tls;

pub use request::*;
pub use tls::*;
