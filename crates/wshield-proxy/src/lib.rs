//! Forward proxy front end for WebShield.
//!
//! Every accepted connection is classified by a
//! [`FilterEngine`](wshield_core::FilterEngine) before any upstream traffic:
//!
//! 1. **HTTP forward** (`forward`) - absolute-form or `Host`-addressed
//!    requests are rewritten to origin-form and relayed with
//!    `Connection: close`. Bodiless requests get one retry on timeout or
//!    reset, as long as nothing reached the client yet.
//!
//! 2. **CONNECT tunnel** (`connect`) - the proxy opens a TCP connection
//!    to `host:port` and splices bytes in both directions. TLS is never
//!    terminated.
//!
//! Blocked HTTP requests get an HTML page naming host and reason; blocked
//! tunnels get a bare `403`. Live connections are tracked in a
//! [`ConnectionRegistry`] and torn down whenever the lists change.

pub mod audit;
pub mod block_page;
pub mod connect;
pub mod error;
pub mod forward;
pub mod handler;
pub mod registry;
pub mod server;
pub mod upstream;

pub use error::{NetErrorCode, ProxyError, Result};
pub use registry::{ActiveConnection, ConnectionGuard, ConnectionRegistry};
pub use server::{ProxyHandle, ProxyServer};
pub use upstream::{DirectConnector, FixedConnector, UpstreamConnector};
