//! rustls backend of the TLS slave.

use crate::{
    config::Config,
    error::Error,
    net::Fd,
    tls::{TlsAcceptor, TlsStream},
};
use ::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig, ServerConnection, StreamOwned,
};
use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::io::{FromRawFd, IntoRawFd},
    path::Path,
    sync::Arc,
};

fn tls_error<E: std::fmt::Display>(err: E) -> Error {
    Error::Tls(err.to_string())
}

/// Server handshakes with one certificate chain.
#[derive(Debug, Clone)]
pub struct RustlsAcceptor {
    config: Arc<ServerConfig>,
}

impl RustlsAcceptor {
    /// Load the certificate chain and key from PEM files; the key may
    /// be stored in the certificate file.
    pub fn from_pem(cert_file: &Path, key_file: Option<&Path>) -> Result<Self, Error> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
        if certs.is_empty() {
            return Err(Error::Tls(format!(
                "no certificate in {}",
                cert_file.display()
            )));
        }

        let key_file = key_file.unwrap_or(cert_file);
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
                .ok_or_else(|| Error::Tls(format!("no private key in {}", key_file.display())))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_error)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Load the files named by `ssl_cert_file` and `ssl_key_file`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let cert_file = config
            .ssl_cert_file
            .as_deref()
            .ok_or_else(|| Error::Config("ssl_enable requires ssl_cert_file".into()))?;
        Self::from_pem(cert_file, config.ssl_key_file.as_deref())
    }
}

impl TlsAcceptor for RustlsAcceptor {
    fn accept(&self, fd: Fd) -> Result<Box<dyn TlsStream>, Error> {
        let conn = ServerConnection::new(self.config.clone()).map_err(tls_error)?;
        let sock = unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) };
        let mut stream = StreamOwned::new(conn, sock);

        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock)?;
        }

        Ok(Box::new(RustlsStream(stream)))
    }
}

#[derive(Debug)]
pub struct RustlsStream(StreamOwned<ServerConnection, TcpStream>);

impl Read for RustlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for RustlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl TlsStream for RustlsStream {
    fn close(&mut self) -> io::Result<()> {
        self.0.conn.send_close_notify();
        self.0.flush()?;
        self.0.sock.shutdown(Shutdown::Both)
    }
}
