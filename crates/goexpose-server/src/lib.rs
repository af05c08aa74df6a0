//! GoExpose tunnel server
//!
//! Accepts mutually authenticated tunnels from remote clients and relays public
//! TCP connections and UDP flows on a shared pool of server ports back through
//! each client's tunnel.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod port_pool;
pub mod relay;
pub mod session;
pub mod streams;
pub mod tls;

pub use acceptor::TunnelAcceptor;
pub use config::{ServerConfig, SessionSettings, TlsPaths};
pub use error::{ConfigError, ServerError, TlsError};
pub use port_pool::{PortAllocator, PortLease, PortPool, PortPoolError};
pub use relay::{Relay, RelayError};
pub use session::{handle_client, SessionContext, SessionEnd, SessionState};
pub use streams::StreamRouter;
pub use tls::ClientIdentity;
