//! Encryption of the control and data connections.
//!
//! The TLS library is an opaque capability: the slave only needs a
//! way to turn a connected descriptor into an encrypted stream.  The
//! optional `tls` feature provides a rustls backend.

use crate::{error::Error, net::Fd};
use std::{
    fmt,
    io::{Read, Write},
};

#[cfg(feature = "tls")]
pub mod rustls;
pub mod slave;

pub use slave::{SlaveClient, SlaveCommand, SlaveReply, SlaveRequest};

/// An established TLS session on a connected socket.
pub trait TlsStream: Read + Write + fmt::Debug {
    /// Send the close notification and shut the connection down.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Server side of the TLS handshake.
pub trait TlsAcceptor {
    /// Perform the handshake on a connected socket.
    fn accept(&self, fd: Fd) -> Result<Box<dyn TlsStream>, Error>;
}

/// The TLS state that is handed over to the slave after login.
pub struct TlsState {
    /// Encrypted control connection.
    pub control: Box<dyn TlsStream>,
    /// Acceptor of the encrypted data connections.
    pub acceptor: Box<dyn TlsAcceptor>,
}

impl fmt::Debug for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsState")
            .field("control", &self.control)
            .finish()
    }
}
