//! pathproxy - a host-in-path HTTPS reverse proxy dispatcher
//!
//! A single listener accepts requests such as `/proxy/example.com/search?q=x`
//! and forwards them over HTTPS to the host embedded in the path, reusing one
//! lazily created upstream per host.
//!
//! The main components are organized into the following modules:
//! - `client_ip`: originating client address resolution
//! - `target`: route prefix and target host extraction
//! - `cache`: the get-or-create-once host map
//! - `upstream`: per-host request rewriting
//! - `forward`: the outbound HTTPS capability
//! - `service`: the dispatcher and its hyper service adapter
//! - `server`: listener and connection handling
//! - `error`: the error taxonomy and its HTTP status mapping

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

pub mod cache;
pub mod client_ip;
pub mod error;
pub mod forward;
pub mod server;
pub mod service;
pub mod target;
pub mod upstream;
pub use hyper;

/// Body type flowing through the dispatcher in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
