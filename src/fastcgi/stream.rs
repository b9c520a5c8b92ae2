//! Backend addressing and the plain byte stream to a responder.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::fastcgi::error::{FcgiError, FcgiResult};

/// Network family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Network {
    type Err = FcgiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(FcgiError::InvalidAddress(format!("unknown network {other:?}"))),
        }
    }
}

/// Where a responder listens: a network family plus an address
/// (`host:port` for TCP, a socket path for Unix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub network: Network,
    pub address: String,
}

impl BackendAddr {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Network::Tcp, address)
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::new(Network::Unix, path)
    }

    /// Open a stream to the backend, giving up after `timeout`.
    pub async fn dial(&self, timeout: Duration) -> FcgiResult<BackendStream> {
        match tokio::time::timeout(timeout, self.open()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(FcgiError::Connect {
                addr: self.to_string(),
                source,
            }),
            Err(_) => Err(FcgiError::DialTimeout {
                addr: self.to_string(),
                timeout,
            }),
        }
    }

    async fn open(&self) -> io::Result<BackendStream> {
        match self.network {
            Network::Tcp => {
                let stream = TcpStream::connect(self.address.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(BackendStream::Tcp(stream))
            }
            #[cfg(unix)]
            Network::Unix => Ok(BackendStream::Unix(UnixStream::connect(&self.address).await?)),
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

/// Parses `"<network>:<address>"`, split at the first colon, e.g.
/// `unix:/run/php/php-fpm.sock` or `tcp:127.0.0.1:9000`.
impl FromStr for BackendAddr {
    type Err = FcgiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, address) = s
            .split_once(':')
            .ok_or_else(|| FcgiError::InvalidAddress(format!("{s:?} is not <network>:<address>")))?;
        if address.is_empty() {
            return Err(FcgiError::InvalidAddress(format!("{s:?} has an empty address")));
        }
        Ok(Self::new(network.parse()?, address))
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// A connected byte stream to a responder.
#[derive(Debug)]
pub enum BackendStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
