// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction for UDP and Serial.
//
// Transports are shared between the run loop (recv) and the reply worker
// (send), so both operations take `&self`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::XrceError;

// ---------------------------------------------------------------------------
// Transport address
// ---------------------------------------------------------------------------

/// Address identifying a remote XRCE client over any transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// UDP socket address.
    Udp(SocketAddr),
    /// Serial port - only one peer, address is the device path.
    Serial(String),
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(sa) => write!(f, "udp://{}", sa),
            Self::Serial(dev) => write!(f, "serial://{}", dev),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the physical transport used between the XRCE agent
/// and its clients.
pub trait XrceTransport: Send + Sync {
    /// Receive bytes into `buf`. Returns `Ok(None)` when nothing arrived
    /// within the transport's poll interval.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, TransportAddr)>, XrceError>;

    /// Send `data` to the given address.
    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError>;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

/// UDP transport. Socket set up with `socket2`, I/O through std.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a UDP socket to `0.0.0.0:<port>`.
    pub fn bind(port: u16, poll_interval: Duration) -> Result<Self, XrceError> {
        Self::bind_addr(([0, 0, 0, 0], port).into(), poll_interval)
    }

    /// Bind to an explicit address. Receives give up after `poll_interval`
    /// so the run loop can notice a stop request.
    pub fn bind_addr(addr: SocketAddr, poll_interval: Duration) -> Result<Self, XrceError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            socket: socket.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, XrceError> {
        Ok(self.socket.local_addr()?)
    }
}

impl XrceTransport for UdpTransport {
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, TransportAddr)>, XrceError> {
        match self.socket.recv_from(buf) {
            Ok((n, peer)) => Ok(Some((n, TransportAddr::Udp(peer)))),
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        match addr {
            TransportAddr::Udp(sa) => {
                self.socket.send_to(data, sa)?;
                Ok(())
            }
            _ => Err(XrceError::Io("UDP transport requires UDP address".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Serial transport (file-based)
// ---------------------------------------------------------------------------

/// Serial transport using basic file I/O.
///
/// The device is opened non-blocking; baud rate configuration is expected
/// to be done externally (e.g. via `stty`). One read is one message: the
/// link is assumed to deliver whole XRCE messages per read.
pub struct SerialTransport {
    device_path: String,
    file: std::fs::File,
    poll_interval: Duration,
}

impl SerialTransport {
    /// Open a serial device for XRCE communication.
    pub fn open(device_path: &str, poll_interval: Duration) -> Result<Self, XrceError> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY);
        }
        let file = options.open(device_path)?;
        Ok(Self {
            device_path: device_path.to_string(),
            file,
            poll_interval,
        })
    }

    pub fn addr(&self) -> TransportAddr {
        TransportAddr::Serial(self.device_path.clone())
    }
}

impl XrceTransport for SerialTransport {
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, TransportAddr)>, XrceError> {
        match (&self.file).read(buf) {
            Ok(0) => {
                std::thread::sleep(self.poll_interval);
                Ok(None)
            }
            Ok(n) => Ok(Some((n, self.addr()))),
            Err(ref e) if is_timeout(e) => {
                std::thread::sleep(self.poll_interval);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, _addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        (&self.file).write_all(data)?;
        Ok(())
    }
}
