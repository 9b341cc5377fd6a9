use std::{
    io::{self, Write as _},
    net::{Ipv4Addr, Ipv6Addr, UdpSocket},
    time::Duration,
};

#[cfg(target_os = "linux")]
use std::os::unix::net::{UnixDatagram, UnixStream};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{RemoteAddr, Transport, TransportError};

enum Client {
    Udp(UdpSocket),

    #[cfg(target_os = "linux")]
    Unixgram(UnixDatagram),

    #[cfg(target_os = "linux")]
    Unix(UnixStream),
}

impl Client {
    fn connect(remote_addr: &RemoteAddr, write_timeout: Duration) -> io::Result<Self> {
        match remote_addr {
            RemoteAddr::Udp(addrs) => {
                let local = if addrs.iter().all(std::net::SocketAddr::is_ipv6) {
                    UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))
                } else {
                    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                };
                local.and_then(|socket| {
                    socket.connect(&addrs[..])?;
                    socket.set_write_timeout(Some(write_timeout))?;
                    Ok(Client::Udp(socket))
                })
            }

            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(path) => UnixDatagram::unbound().and_then(|socket| {
                socket.connect(path)?;
                socket.set_write_timeout(Some(write_timeout))?;
                Ok(Client::Unixgram(socket))
            }),

            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(path) => UnixStream::connect(path).and_then(|socket| {
                socket.set_write_timeout(Some(write_timeout))?;
                Ok(Client::Unix(socket))
            }),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Client::Udp(socket) => socket.send(buf),

            #[cfg(target_os = "linux")]
            Client::Unixgram(socket) => socket.send(buf),

            // Stream sockets carry no message boundaries, so every payload is prefixed with its length.
            #[cfg(target_os = "linux")]
            Client::Unix(socket) => {
                let len = u32::try_from(buf.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
                socket.write_all(&len.to_le_bytes())?;
                socket.write_all(buf)?;
                Ok(buf.len())
            }
        }
    }
}

enum ClientState {
    // Intermediate state during send attempts.
    Inconsistent,

    // Transport is currently disconnected.
    Disconnected,

    // Transport is connected and ready to send payloads.
    Ready(Client),

    // Transport has been shut down and will not reconnect.
    Closed,
}

impl ClientState {
    fn try_send(
        &mut self,
        remote_addr: &RemoteAddr,
        write_timeout: Duration,
        payload: &[u8],
    ) -> Result<usize, TransportError> {
        loop {
            let old_state = std::mem::replace(self, ClientState::Inconsistent);
            match old_state {
                ClientState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                ClientState::Closed => {
                    *self = ClientState::Closed;
                    return Err(TransportError::Shutdown);
                }
                ClientState::Disconnected => {
                    // Stay disconnected if we can't connect, so the next send tries again.
                    *self = ClientState::Disconnected;
                    let client = Client::connect(remote_addr, write_timeout)?;
                    debug!(
                        transport = remote_addr.transport_id(),
                        length_prefixed = remote_addr.requires_length_prefix(),
                        "Connected to remote collector."
                    );
                    *self = ClientState::Ready(client);
                }
                ClientState::Ready(mut client) => {
                    let result = client.send(payload);
                    if result.is_ok() {
                        *self = ClientState::Ready(client);
                    } else {
                        *self = ClientState::Disconnected;
                    }

                    return result.map_err(Into::into);
                }
            };
        }
    }
}

enum Chunk<'a> {
    Datagram(&'a str),
    Oversized(usize),
}

/// Splits a newline-delimited payload into chunks of at most `max_len` bytes, without splitting any line.
///
/// Lines that are longer than `max_len` by themselves cannot be sent and are reported by length.
fn chunk_payload(payload: &str, max_len: usize) -> Vec<Chunk<'_>> {
    let mut chunks = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in payload.split('\n') {
        let line_start = offset;
        let line_end = offset + line.len();
        offset = line_end + 1;

        if line.is_empty() {
            continue;
        }

        if line.len() > max_len {
            if let Some((start, end)) = current.take() {
                chunks.push(Chunk::Datagram(&payload[start..end]));
            }
            chunks.push(Chunk::Oversized(line.len()));
            continue;
        }

        current = match current {
            Some((start, _)) if line_end - start <= max_len => Some((start, line_end)),
            Some((start, end)) => {
                chunks.push(Chunk::Datagram(&payload[start..end]));
                Some((line_start, line_end))
            }
            None => Some((line_start, line_end)),
        };
    }

    if let Some((start, end)) = current {
        chunks.push(Chunk::Datagram(&payload[start..end]));
    }

    chunks
}

/// Sends payloads over UDP, or over Unix domain sockets on Linux.
///
/// The socket is connected lazily on the first send, and dropped after a failed send so that the next send
/// reconnects. Payloads longer than the maximum payload length are split on line boundaries into several writes.
pub struct UdpTransport {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    max_payload_len: usize,
    state: Mutex<ClientState>,
}

impl UdpTransport {
    /// Creates a new `UdpTransport` for the given address.
    ///
    /// The address is either `<host>:<port>` for UDP, or `unix://<path>` / `unixgram://<path>` for a Unix stream or
    /// datagram socket.
    ///
    /// # Errors
    ///
    /// If the address cannot be parsed or resolved, an error describing the reason is returned.
    pub fn new(addr: &str, write_timeout: Duration, max_payload_len: usize) -> Result<Self, String> {
        let remote_addr = RemoteAddr::try_from(addr)?;
        Ok(Self::from_remote_addr(remote_addr, write_timeout, max_payload_len))
    }

    pub(crate) fn from_remote_addr(
        remote_addr: RemoteAddr,
        write_timeout: Duration,
        max_payload_len: usize,
    ) -> Self {
        UdpTransport {
            remote_addr,
            write_timeout,
            max_payload_len,
            state: Mutex::new(ClientState::Disconnected),
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let mut result = Ok(());

        for chunk in chunk_payload(payload, self.max_payload_len) {
            let outcome = match chunk {
                Chunk::Datagram(datagram) => state
                    .try_send(&self.remote_addr, self.write_timeout, datagram.as_bytes())
                    .map(|written| trace!(written, "Sent datagram.")),
                Chunk::Oversized(len) => {
                    Err(TransportError::PayloadTooLarge { len, max: self.max_payload_len })
                }
            };

            // Keep going so one bad chunk doesn't take the rest of the payload with it, but report the first failure.
            if let Err(e) = outcome {
                if matches!(e, TransportError::Shutdown) {
                    return Err(e);
                }
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    fn shutdown(&self) {
        *self.state.lock() = ClientState::Closed;
    }

    fn transport_id(&self) -> &'static str {
        self.remote_addr.transport_id()
    }
}
