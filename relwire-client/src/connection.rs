//! Connection settings and the byte-stream transport under a port.

use crate::auth::{LEGACY_PLUGIN, SCRAM_PLUGIN};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Client side of the wire encryption negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCrypt {
    Disabled,
    #[default]
    Enabled,
    Required,
}

impl WireCrypt {
    /// Value sent in the user identification block.
    pub fn as_u32(self) -> u32 {
        match self {
            WireCrypt::Disabled => 0,
            WireCrypt::Enabled => 1,
            WireCrypt::Required => 2,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout; `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub user: String,
    pub password: String,
    /// Authentication plugins in order of preference.
    pub auth_plugins: Vec<String>,
    pub wire_crypt: WireCrypt,
    /// Offer the lazy packet type so poolable requests can be deferred.
    pub lazy: bool,
    /// Process name reported in the attachment parameters.
    pub process_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            user: String::new(),
            password: String::new(),
            auth_plugins: vec![SCRAM_PLUGIN.to_string(), LEGACY_PLUGIN.to_string()],
            wire_crypt: WireCrypt::default(),
            lazy: true,
            process_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_auth_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wire_crypt(mut self, level: WireCrypt) -> Self {
        self.wire_crypt = level;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Blocking byte stream.
///
/// A port reads from one transport and writes to another so a second
/// thread can push a frame while the first is blocked in `receive`.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Reads some bytes; `Ok(0)` means the peer closed the stream.
    fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Transport over a TCP socket.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        tracing::debug!("Connecting to {}...", addr);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Splits into a reading and a writing half over the same socket.
    pub fn split(self) -> std::io::Result<(TcpTransport, TcpTransport)> {
        let writer = self.stream.try_clone()?;
        Ok((self, TcpTransport { stream: writer }))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
