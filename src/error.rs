use std::{io, net::SocketAddr};

/// The listener's only failure mode: the socket could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to register listener with the runtime: {0}")]
    Register(#[source] io::Error),
}
