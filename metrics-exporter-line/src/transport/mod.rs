//! Transports that carry encoded payloads to the remote collector.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs as _},
};

#[cfg(target_os = "linux")]
use std::path::PathBuf;

use thiserror::Error;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use self::http::HttpTransport;

mod udp;
pub use self::udp::UdpTransport;

/// Errors that could occur while sending a payload.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An I/O error occurred while connecting or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A single line in the payload is larger than the maximum payload length.
    #[error("line of {len} bytes exceeds maximum payload length of {max} bytes")]
    PayloadTooLarge {
        /// Length of the offending line.
        len: usize,
        /// Maximum payload length.
        max: usize,
    },

    /// The remote server answered with an unsuccessful HTTP status.
    #[error("unexpected HTTP status {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be built or performed.
    #[error("request failed: {reason}")]
    Request {
        /// Details about the failure.
        reason: String,
    },

    /// The transport has been shut down.
    #[error("transport is shut down")]
    Shutdown,
}

/// A sink for encoded payloads.
///
/// A payload is one or more encoded lines joined with a newline. Sends are best-effort: the caller logs a failure and
/// moves on, and never retries.
pub trait Transport: Send + Sync {
    /// Sends a payload to the default destination.
    ///
    /// # Errors
    ///
    /// If the payload could not be sent, an error is returned.
    fn send(&self, payload: &str) -> Result<(), TransportError>;

    /// Sends a payload to a specific destination, such as the path for one aggregation kind and frequency.
    ///
    /// Transports without a notion of destinations send to their default destination.
    ///
    /// # Errors
    ///
    /// If the payload could not be sent, an error is returned.
    fn send_to(&self, payload: &str, destination: &str) -> Result<(), TransportError> {
        let _ = destination;
        self.send(payload)
    }

    /// Releases any resources held by the transport.
    ///
    /// Sends after shutdown fail with [`TransportError::Shutdown`].
    fn shutdown(&self) {}

    /// Returns a short identifier for the transport, such as `udp`.
    fn transport_id(&self) -> &'static str {
        "custom"
    }
}

#[derive(Clone, Debug)]
pub(crate) enum RemoteAddr {
    Udp(Vec<SocketAddr>),

    #[cfg(target_os = "linux")]
    Unixgram(PathBuf),

    #[cfg(target_os = "linux")]
    Unix(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp(_) => "udp",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => "uds-stream",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(_) => "uds",
        }
    }

    /// Returns `true` if payloads must be prefixed with their length.
    pub fn requires_length_prefix(&self) -> bool {
        match self {
            RemoteAddr::Udp(_) => false,
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(_) => false,
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => true,
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        #[cfg(target_os = "linux")]
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "unix" => Ok(RemoteAddr::Unix(PathBuf::from(path))),
                "unixgram" => Ok(RemoteAddr::Unixgram(PathBuf::from(path))),
                _ => Err(format!("invalid scheme '{scheme}' (expected 'unix' or 'unixgram')")),
            };
        }

        match addr.to_socket_addrs() {
            Ok(addrs) => {
                let addrs = addrs.collect::<Vec<_>>();
                if addrs.is_empty() {
                    Err(format!("address '{addr}' did not resolve to any socket address"))
                } else {
                    Ok(RemoteAddr::Udp(addrs))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}
