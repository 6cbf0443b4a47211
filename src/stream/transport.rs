//! Dialers for the control-plane connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{AppError, BoxFuture, Result};

/// Byte stream a [`Transport`] hands back.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed connection.
pub type BoxedStream = Box<dyn StreamIo>;

/// Opens raw connections to the control plane. Authentication and framing
/// happen on top, in the event stream.
pub trait Transport: Send + Sync {
    /// Open one connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the peer cannot be reached.
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream>>;

    /// Peer description for logs.
    fn describe(&self) -> String;
}

/// Plain TCP dialer.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    timeout: Duration,
}

impl TcpTransport {
    /// Dial `address` (`host:port`), giving up after `timeout`.
    #[must_use]
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| {
                    AppError::Transport(format!("connect to {} timed out", self.address))
                })?
                .map_err(|err| {
                    AppError::Transport(format!("connect to {} failed: {err}", self.address))
                })?;
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%err, "failed to set TCP_NODELAY");
            }
            let boxed: BoxedStream = Box::new(stream);
            Ok(boxed)
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}
