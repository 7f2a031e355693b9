use std::io;

use thiserror::Error;

/// Errors `Server::serve` can report synchronously, before any loop thread
/// has started. Everything past this point is either absorbed into a
/// handler callback or logged — see `spec.md` §7.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open poller: {0}")]
    PollerInit(#[source] io::Error),

    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to construct load balancer: {0}")]
    LoadBalancerInit(String),

    #[error("failed to register listener with poller: {0}")]
    Register(#[source] io::Error),
}

/// Returned by `Server::add_tcp_connector` when the caller hands a value
/// that doesn't conform to `{int fd, sockaddr}`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("value handed to add_tcp_connector does not conform to {{int fd, sockaddr}}")]
pub struct TypeMismatch;
