use std::{convert::Infallible, io, net::SocketAddr, time::Duration};

use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument as _;

use crate::{config::ListenConfig, error::Error, responder::respond};

const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(5);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Listener {
    inner: tokio::net::TcpListener,
}

/// Binds and listens on `config.addr`.
///
/// Must be called from within a tokio runtime, the socket is registered with
/// its reactor right away.
pub fn bind(config: &ListenConfig) -> Result<Listener, Error> {
    let socket = bind_socket(config).map_err(|source| Error::Listen {
        addr: config.addr,
        source,
    })?;
    let inner = tokio::net::TcpListener::from_std(socket).map_err(Error::Register)?;
    Ok(Listener { inner })
}

fn bind_socket(config: &ListenConfig) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        Domain::for_address(config.addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&config.addr.into())?;
    socket.listen(config.backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(self) {
        match self.local_addr() {
            Ok(addr) => tracing::info!(message = "Accepting requests.", addr = %addr),
            Err(err) => tracing::info!(message = "Accepting requests.", addr_error = %err),
        }

        let mut failures = 0u32;
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_retry_delay(failures);
                    if failures == 1 {
                        tracing::warn!(message = "Failed to accept connection", error = %err);
                    } else {
                        tracing::debug!(
                            message = "Failed to accept connection",
                            error = %err,
                            failures,
                            ?delay
                        );
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(message = "Could not set TCP_NODELAY", error = %err);
            }

            let span = tracing::debug_span!("connection", peer = %peer);
            tokio::spawn(
                async move {
                    tracing::debug!("Accepted connection");
                    if let Err(err) = serve_connection(stream).await {
                        tracing::debug!(message = "Connection failed", error = %err);
                    }
                    tracing::debug!("Closing connection");
                }
                .instrument(span),
            );
        }
    }
}

/// Backoff before the next `accept` after `failures` consecutive errors, so
/// that fd exhaustion does not turn the loop into a busy spin.
fn accept_retry_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_RETRY_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_RETRY_MAX)
}

/// Serves a single HTTP/1.1 connection until the peer goes away.
///
/// Works over any byte stream, so the fixture replay drives it through an
/// in-memory pipe exactly as the accept loop drives it through TCP.
pub async fn serve_connection<I>(io: I) -> Result<(), hyper::Error>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    let service = service_fn(|req| async move { Ok::<_, Infallible>(respond(req)) });
    http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
}
