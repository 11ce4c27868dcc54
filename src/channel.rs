//! Private channel between exactly two processes.
//!
//! A channel is a UNIX socketpair that is created before a fork; each
//! side then picks its own end with [`Channel::set_parent_context`] or
//! [`Channel::set_child_context`], which closes the other end in the
//! calling process.  The wire carries three primitive shapes: a one
//! byte tag, a native-endian 4 byte integer (also used as length prefix
//! of opaque buffers), and descriptors passed with `SCM_RIGHTS`.
//!
//! There is no resynchronization: any short read or write returns
//! [`Error::ShortMessage`] and the caller is expected to terminate.

use crate::{
    error::Error,
    net::{self, Fd},
};
use bytes::BytesMut;
use std::{
    convert::TryFrom,
    io::{self, Read, Write},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
};
use zerocopy::{AsBytes, FromBytes};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Context {
    Unset,
    Parent,
    Child,
}

/// One private channel and the context of the current process.
#[derive(Debug)]
pub struct Channel {
    /// End used by the serving side.
    parent: Option<UnixStream>,
    /// End used by the requesting side.
    child: Option<UnixStream>,
    context: Context,
}

impl Channel {
    /// Upper bound for a peer-supplied buffer length.
    pub const MAX_BUFFER: usize = 65536;

    /// Create a new socketpair; both ends are open until a context is set.
    pub fn new() -> Result<Self, Error> {
        let (parent, child) = UnixStream::pair()?;
        Ok(Self {
            parent: Some(parent),
            child: Some(child),
            context: Context::Unset,
        })
    }

    /// Create both ends with their context already set.
    pub fn pair() -> Result<(Self, Self), Error> {
        let (parent, child) = UnixStream::pair()?;
        Ok((
            Self {
                parent: Some(parent),
                child: None,
                context: Context::Parent,
            },
            Self {
                parent: None,
                child: Some(child),
                context: Context::Child,
            },
        ))
    }

    /// Keep the parent end and close the child end in this process.
    pub fn set_parent_context(&mut self) -> Result<(), Error> {
        if self.context != Context::Unset {
            return Err(Error::ContextAlreadySet);
        }
        self.child = None;
        self.context = Context::Parent;
        Ok(())
    }

    /// Keep the child end and close the parent end in this process.
    pub fn set_child_context(&mut self) -> Result<(), Error> {
        if self.context != Context::Unset {
            return Err(Error::ContextAlreadySet);
        }
        self.parent = None;
        self.context = Context::Child;
        Ok(())
    }

    /// Returns true if this process holds the parent end.
    pub fn is_parent(&self) -> bool {
        self.context == Context::Parent
    }

    /// Close both ends; the channel can not be used afterwards.
    pub fn close(&mut self) {
        self.parent = None;
        self.child = None;
    }

    /// Raw descriptors that are still open in this process.
    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.parent
            .iter()
            .chain(self.child.iter())
            .map(AsRawFd::as_raw_fd)
    }

    fn socket(&self) -> Result<&UnixStream, Error> {
        let socket = match self.context {
            Context::Unset => return Err(Error::NoContext),
            Context::Parent => self.parent.as_ref(),
            Context::Child => self.child.as_ref(),
        };
        socket.ok_or(Error::Bug("channel used after close"))
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), Error> {
        self.socket()?.write_all(buf).map_err(short_message)
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        self.socket()?.read_exact(buf).map_err(short_message)
    }

    /// Send a one byte command or result tag.
    pub fn send_cmd<T: Into<u8>>(&self, tag: T) -> Result<(), Error> {
        self.write_all(&[tag.into()])
    }

    /// Receive a one byte tag, or `None` if the peer has gone away.
    pub fn recv_cmd(&self) -> Result<Option<u8>, Error> {
        let mut tag = [0u8; 1];
        loop {
            match self.socket()?.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(tag[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Receive a tag that must be present.
    pub fn expect_cmd(&self) -> Result<u8, Error> {
        self.recv_cmd()?.ok_or(Error::ShortMessage)
    }

    pub fn send_int(&self, value: i32) -> Result<(), Error> {
        self.write_all(value.as_bytes())
    }

    pub fn recv_int(&self) -> Result<i32, Error> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        i32::read_from(&buf[..]).ok_or(Error::ShortMessage)
    }

    /// Send a length-prefixed opaque buffer.
    pub fn send_buf(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > Self::MAX_BUFFER {
            return Err(Error::BufferTooLarge(buf.len() as i64, Self::MAX_BUFFER));
        }
        let length = i32::try_from(buf.len()).map_err(|_| Error::ShortMessage)?;
        self.send_int(length)?;
        self.write_all(buf)
    }

    /// Receive a length-prefixed buffer of at most `max` bytes.
    ///
    /// The length is checked before any of the body is read.
    pub fn recv_buf(&self, max: usize) -> Result<BytesMut, Error> {
        let length = self.recv_int()?;
        let max = max.min(Self::MAX_BUFFER);
        let length = match usize::try_from(length) {
            Ok(length) if length <= max => length,
            _ => return Err(Error::BufferTooLarge(length as i64, max)),
        };

        let mut buf = BytesMut::with_capacity(length);
        buf.resize(length, 0);
        self.read_exact(&mut buf[..])?;
        Ok(buf)
    }

    pub fn send_str(&self, value: &str) -> Result<(), Error> {
        self.send_buf(value.as_bytes())
    }

    /// Receive a string; invalid UTF-8 is replaced, not rejected.
    pub fn recv_str(&self) -> Result<String, Error> {
        let buf = self.recv_buf(Self::MAX_BUFFER)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn send_fd(&self, fd: &Fd) -> Result<(), Error> {
        net::send_fd(self.socket()?, fd)
    }

    pub fn recv_fd(&self) -> Result<Fd, Error> {
        net::recv_fd(self.socket()?)
    }
}

fn short_message(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => Error::ShortMessage,
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_once() {
        let mut channel = Channel::new().unwrap();
        assert!(matches!(channel.send_int(1), Err(Error::NoContext)));

        channel.set_parent_context().unwrap();
        assert!(channel.is_parent());
        assert_eq!(channel.raw_fds().count(), 1);
        assert!(matches!(
            channel.set_child_context(),
            Err(Error::ContextAlreadySet)
        ));
        assert!(matches!(
            channel.set_parent_context(),
            Err(Error::ContextAlreadySet)
        ));
    }

    #[test]
    fn test_closed_channel() {
        let mut channel = Channel::new().unwrap();
        channel.set_child_context().unwrap();
        channel.close();
        assert!(matches!(channel.send_cmd(1u8), Err(Error::Bug(_))));
    }
}
