//! Error types for transports and connection establishment.

use std::net::SocketAddr;
use std::time::Duration;

use pva_core::WireError;

use crate::registry::TransportKey;

/// Errors raised by an established transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport to {0} is closed")]
    Closed(SocketAddr),

    #[error("transport to {0} has not completed validation")]
    NotValidated(SocketAddr),

    /// Fatal to the connection; never patched over.
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to the caller of `Connector::connect`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up waiting {waited:?} for the reservation on {key}, possible deadlock")]
    PossibleDeadlock { key: TransportKey, waited: Duration },

    #[error("validation with {0} timed out")]
    ValidationTimeout(SocketAddr),

    #[error("{addr} refused validation: {message}")]
    ValidationRefused { addr: SocketAddr, message: String },

    #[error("transport to {0} closed during establishment")]
    Closed(SocketAddr),

    /// A live transport already exists under this key. The reservation
    /// should have made this impossible.
    #[error("a live transport is already installed for {0}")]
    DuplicateInstall(TransportKey),

    #[error("search for {0} was canceled")]
    SearchCanceled(String),
}
