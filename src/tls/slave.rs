//! The TLS slave and its private channel.
//!
//! After a login on an encrypted control connection, the pre-login
//! process keeps the TLS session and serves the post-login process.
//! The protocol handler never holds TLS state itself; it sends one
//! [`SlaveRequest`] and blocks for the [`SlaveReply`] of that request.

use crate::{
    broker::PrivResult,
    channel::Channel,
    error::Error,
    net::Fd,
    tls::{TlsState, TlsStream},
};
use bytes::BytesMut;
use ftp_privsep_derive::Tag;
use ftp_privsep_log::{debug, info, warn};
use std::{
    convert::TryFrom,
    io::{self, Read, Write},
};

/// Maximum length of one line on the control connection.
pub const MAX_COMMAND_LINE: usize = 4096;

/// Commands understood by the TLS slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Tag)]
#[repr(u8)]
pub enum SlaveCommand {
    GetUserCmd = 4,
    WriteUserResp = 5,
    Handshake = 6,
    Close = 7,
    Read = 8,
    Write = 9,
}

#[derive(Debug)]
pub enum SlaveRequest {
    /// Read one line from the control connection.
    GetUserCmd,
    /// Write a response to the control connection.
    WriteUserResp(BytesMut),
    /// Start TLS on a new data connection.
    Handshake(Fd),
    /// Shut down the data connection.
    Close,
    /// Read up to this many bytes from the data connection.
    Read(usize),
    /// Write to the data connection.
    Write(BytesMut),
}

impl SlaveRequest {
    pub fn command(&self) -> SlaveCommand {
        match self {
            Self::GetUserCmd => SlaveCommand::GetUserCmd,
            Self::WriteUserResp(_) => SlaveCommand::WriteUserResp,
            Self::Handshake(_) => SlaveCommand::Handshake,
            Self::Close => SlaveCommand::Close,
            Self::Read(_) => SlaveCommand::Read,
            Self::Write(_) => SlaveCommand::Write,
        }
    }

    pub fn send(&self, channel: &Channel) -> Result<(), Error> {
        channel.send_cmd(self.command())?;
        match self {
            Self::WriteUserResp(buf) | Self::Write(buf) => channel.send_buf(buf),
            Self::Handshake(fd) => channel.send_fd(fd),
            Self::Read(len) => {
                let len = i32::try_from(*len)
                    .map_err(|_| Error::BufferTooLarge(*len as i64, Channel::MAX_BUFFER))?;
                channel.send_int(len)
            }
            Self::GetUserCmd | Self::Close => Ok(()),
        }
    }

    /// Receive the next request, or `None` if the peer closed the channel.
    pub fn recv(channel: &Channel) -> Result<Option<Self>, Error> {
        let tag = match channel.recv_cmd()? {
            Some(tag) => tag,
            None => return Ok(None),
        };
        let command = SlaveCommand::try_from(tag).map_err(Error::UnexpectedCommand)?;

        let request = match command {
            SlaveCommand::GetUserCmd => Self::GetUserCmd,
            SlaveCommand::WriteUserResp => {
                Self::WriteUserResp(channel.recv_buf(Channel::MAX_BUFFER)?)
            }
            SlaveCommand::Handshake => Self::Handshake(channel.recv_fd()?),
            SlaveCommand::Close => Self::Close,
            SlaveCommand::Read => {
                let len = channel.recv_int()?;
                match usize::try_from(len) {
                    Ok(len) if len <= Channel::MAX_BUFFER => Self::Read(len),
                    _ => return Err(Error::BufferTooLarge(len as i64, Channel::MAX_BUFFER)),
                }
            }
            SlaveCommand::Write => Self::Write(channel.recv_buf(Channel::MAX_BUFFER)?),
        };

        Ok(Some(request))
    }
}

#[derive(Debug, PartialEq)]
pub enum SlaveReply {
    /// One control line; `None` when the client went away.
    UserCmd(Option<BytesMut>),
    WriteUserResp(bool),
    Handshake(bool),
    Close(bool),
    /// Data read; empty at the end of the stream, `None` on error.
    Read(Option<BytesMut>),
    /// Number of bytes written, `None` on error.
    Write(Option<usize>),
}

impl SlaveReply {
    pub fn send(&self, channel: &Channel) -> Result<(), Error> {
        match self {
            Self::UserCmd(Some(buf)) | Self::Read(Some(buf)) => {
                channel.send_cmd(PrivResult::Ok)?;
                channel.send_buf(buf)
            }
            Self::UserCmd(None) | Self::Read(None) => channel.send_cmd(PrivResult::Bad),
            Self::WriteUserResp(ok) | Self::Handshake(ok) | Self::Close(ok) => {
                channel.send_cmd(PrivResult::from(*ok))
            }
            Self::Write(Some(len)) => {
                channel.send_int(i32::try_from(*len).map_err(|_| Error::ShortMessage)?)
            }
            Self::Write(None) => channel.send_int(-1),
        }
    }

    /// Receive the reply to `command`.
    pub fn recv(channel: &Channel, command: SlaveCommand) -> Result<Self, Error> {
        let reply = match command {
            SlaveCommand::GetUserCmd => Self::UserCmd(recv_optional_buf(channel)?),
            SlaveCommand::WriteUserResp => Self::WriteUserResp(recv_result(channel)?),
            SlaveCommand::Handshake => Self::Handshake(recv_result(channel)?),
            SlaveCommand::Close => Self::Close(recv_result(channel)?),
            SlaveCommand::Read => Self::Read(recv_optional_buf(channel)?),
            SlaveCommand::Write => match channel.recv_int()? {
                -1 => Self::Write(None),
                len => Self::Write(Some(usize::try_from(len).map_err(|_| Error::ShortMessage)?)),
            },
        };

        Ok(reply)
    }
}

fn recv_result(channel: &Channel) -> Result<bool, Error> {
    let tag = channel.expect_cmd()?;
    match PrivResult::try_from(tag).map_err(Error::UnexpectedCommand)? {
        PrivResult::Ok => Ok(true),
        PrivResult::Bad => Ok(false),
    }
}

fn recv_optional_buf(channel: &Channel) -> Result<Option<BytesMut>, Error> {
    if recv_result(channel)? {
        channel.recv_buf(Channel::MAX_BUFFER).map(Some)
    } else {
        Ok(None)
    }
}

/// The process holding the TLS sessions.
#[derive(Debug)]
pub struct Slave {
    channel: Channel,
    state: TlsState,
    data: Option<Box<dyn TlsStream>>,
    /// Control input read beyond the last returned line.
    pending: BytesMut,
}

impl Slave {
    /// Serve requests on `channel`, which must be in parent context.
    pub fn new(channel: Channel, state: TlsState) -> Self {
        Self {
            channel,
            state,
            data: None,
            pending: BytesMut::new(),
        }
    }

    /// Serve requests until the protocol process closes the channel.
    pub fn run(mut self) -> Result<(), Error> {
        while let Some(request) = SlaveRequest::recv(&self.channel)? {
            debug!("slave request {}", request.command().as_ref());
            let reply = self.handle(request);
            reply.send(&self.channel)?;
        }

        debug!("protocol process closed the slave channel");
        if let Some(mut data) = self.data.take() {
            let _ = data.close();
        }
        let _ = self.state.control.close();
        Ok(())
    }

    /// Perform one request.
    pub fn handle(&mut self, request: SlaveRequest) -> SlaveReply {
        match request {
            SlaveRequest::GetUserCmd => SlaveReply::UserCmd(self.read_line()),
            SlaveRequest::WriteUserResp(buf) => {
                let control = &mut self.state.control;
                let result = control.write_all(&buf).and_then(|_| control.flush());
                SlaveReply::WriteUserResp(log_io("control write", result).is_some())
            }
            SlaveRequest::Handshake(fd) => SlaveReply::Handshake(self.handshake(fd)),
            SlaveRequest::Close => {
                let result = match self.data.take() {
                    Some(mut data) => log_io("data close", data.close()).is_some(),
                    None => {
                        warn!("close without a data connection");
                        false
                    }
                };
                SlaveReply::Close(result)
            }
            SlaveRequest::Read(len) => {
                let data = match self.data.as_mut() {
                    Some(data) => data,
                    None => {
                        warn!("read without a data connection");
                        return SlaveReply::Read(None);
                    }
                };
                let mut buf = BytesMut::with_capacity(len);
                buf.resize(len, 0);
                SlaveReply::Read(log_io("data read", read_retry(data, &mut buf)).map(|n| {
                    buf.truncate(n);
                    buf
                }))
            }
            SlaveRequest::Write(buf) => match self.data.as_mut() {
                Some(data) => {
                    let result = data.write_all(&buf).map(|_| buf.len());
                    SlaveReply::Write(log_io("data write", result))
                }
                None => {
                    warn!("write without a data connection");
                    SlaveReply::Write(None)
                }
            },
        }
    }

    fn handshake(&mut self, fd: Fd) -> bool {
        if self.data.is_some() {
            warn!("handshake while a data connection is active");
            return false;
        }
        match self.state.acceptor.accept(fd) {
            Ok(stream) => {
                self.data = Some(stream);
                true
            }
            Err(err) => {
                info!("data connection handshake failed: {}", err);
                false
            }
        }
    }

    /// Return the next line including its newline; overlong lines are
    /// split at [`MAX_COMMAND_LINE`].
    fn read_line(&mut self) -> Option<BytesMut> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                return Some(self.pending.split_to(pos + 1));
            }
            if self.pending.len() >= MAX_COMMAND_LINE {
                return Some(self.pending.split_to(MAX_COMMAND_LINE));
            }

            let mut buf = [0u8; 1024];
            match read_retry(&mut self.state.control, &mut buf) {
                Ok(0) if self.pending.is_empty() => return None,
                Ok(0) => return Some(self.pending.split()),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(err) => {
                    info!("control read failed: {}", err);
                    return None;
                }
            }
        }
    }
}

fn read_retry(stream: &mut Box<dyn TlsStream>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

fn log_io<T>(what: &str, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            info!("{} failed: {}", what, err);
            None
        }
    }
}

/// Requests to the TLS slave from the protocol process.
#[derive(Debug, Clone, Copy)]
pub struct SlaveClient<'a> {
    channel: &'a Channel,
}

impl<'a> SlaveClient<'a> {
    pub fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    fn call(&self, request: &SlaveRequest) -> Result<SlaveReply, Error> {
        request.send(self.channel)?;
        SlaveReply::recv(self.channel, request.command())
    }

    pub fn get_user_cmd(&self) -> Result<Option<BytesMut>, Error> {
        match self.call(&SlaveRequest::GetUserCmd)? {
            SlaveReply::UserCmd(line) => Ok(line),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }

    pub fn write_user_resp(&self, buf: &[u8]) -> Result<bool, Error> {
        match self.call(&SlaveRequest::WriteUserResp(BytesMut::from(buf)))? {
            SlaveReply::WriteUserResp(ok) => Ok(ok),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }

    pub fn handshake(&self, fd: Fd) -> Result<bool, Error> {
        match self.call(&SlaveRequest::Handshake(fd))? {
            SlaveReply::Handshake(ok) => Ok(ok),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }

    pub fn close(&self) -> Result<bool, Error> {
        match self.call(&SlaveRequest::Close)? {
            SlaveReply::Close(ok) => Ok(ok),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }

    pub fn read(&self, len: usize) -> Result<Option<BytesMut>, Error> {
        match self.call(&SlaveRequest::Read(len.min(Channel::MAX_BUFFER)))? {
            SlaveReply::Read(data) => Ok(data),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<Option<usize>, Error> {
        let len = buf.len().min(Channel::MAX_BUFFER);
        match self.call(&SlaveRequest::Write(BytesMut::from(&buf[..len])))? {
            SlaveReply::Write(written) => Ok(written),
            _ => Err(Error::Bug("mismatched slave reply")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsAcceptor;
    use nix::unistd::pipe;
    use std::{cell::RefCell, io::Cursor, rc::Rc, thread};

    #[derive(Debug)]
    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TlsStream for MockStream {
        fn close(&mut self) -> io::Result<()> {
            self.output.borrow_mut().extend_from_slice(b"<close>");
            Ok(())
        }
    }

    struct MockAcceptor {
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl TlsAcceptor for MockAcceptor {
        fn accept(&self, _fd: Fd) -> Result<Box<dyn TlsStream>, Error> {
            Ok(Box::new(MockStream {
                input: Cursor::new(b"payload".to_vec()),
                output: self.output.clone(),
            }))
        }
    }

    fn slave(input: &[u8]) -> (Slave, Channel, Rc<RefCell<Vec<u8>>>, Rc<RefCell<Vec<u8>>>) {
        let control_out = Rc::new(RefCell::new(Vec::new()));
        let data_out = Rc::new(RefCell::new(Vec::new()));
        let state = TlsState {
            control: Box::new(MockStream {
                input: Cursor::new(input.to_vec()),
                output: control_out.clone(),
            }),
            acceptor: Box::new(MockAcceptor {
                output: data_out.clone(),
            }),
        };
        let (parent, child) = Channel::pair().unwrap();
        (Slave::new(parent, state), child, control_out, data_out)
    }

    fn data_fd() -> Fd {
        let (r, w) = pipe().unwrap();
        drop(Fd::from(w));
        Fd::from(r)
    }

    #[test]
    fn test_tags() {
        assert_eq!(u8::from(SlaveCommand::GetUserCmd), 4);
        assert_eq!(SlaveCommand::try_from(9u8), Ok(SlaveCommand::Write));
        assert_eq!(SlaveCommand::try_from(1u8), Err(1));
        assert_eq!(SlaveCommand::WriteUserResp.as_ref(), "write-user-resp");
    }

    #[test]
    fn test_control_lines() {
        let (mut slave, _channel, control_out, _) = slave(b"USER ftp\r\nPASS x\r\nQUIT");
        assert_eq!(
            slave.handle(SlaveRequest::GetUserCmd),
            SlaveReply::UserCmd(Some(BytesMut::from(&b"USER ftp\r\n"[..])))
        );
        assert_eq!(
            slave.handle(SlaveRequest::GetUserCmd),
            SlaveReply::UserCmd(Some(BytesMut::from(&b"PASS x\r\n"[..])))
        );
        assert_eq!(
            slave.handle(SlaveRequest::GetUserCmd),
            SlaveReply::UserCmd(Some(BytesMut::from(&b"QUIT"[..])))
        );
        assert_eq!(
            slave.handle(SlaveRequest::GetUserCmd),
            SlaveReply::UserCmd(None)
        );

        let reply = slave.handle(SlaveRequest::WriteUserResp(BytesMut::from(&b"221 Bye\r\n"[..])));
        assert_eq!(reply, SlaveReply::WriteUserResp(true));
        assert_eq!(&control_out.borrow()[..], b"221 Bye\r\n");
    }

    #[test]
    fn test_overlong_line() {
        let input = vec![b'A'; MAX_COMMAND_LINE + 10];
        let (mut slave, _channel, _, _) = slave(&input);
        match slave.handle(SlaveRequest::GetUserCmd) {
            SlaveReply::UserCmd(Some(line)) => assert_eq!(line.len(), MAX_COMMAND_LINE),
            reply => panic!("unexpected reply {:?}", reply),
        }
    }

    #[test]
    fn test_data_connection_state() {
        let (mut slave, _channel, _, data_out) = slave(b"");

        assert_eq!(slave.handle(SlaveRequest::Read(16)), SlaveReply::Read(None));
        assert_eq!(slave.handle(SlaveRequest::Close), SlaveReply::Close(false));

        assert_eq!(
            slave.handle(SlaveRequest::Handshake(data_fd())),
            SlaveReply::Handshake(true)
        );
        assert_eq!(
            slave.handle(SlaveRequest::Handshake(data_fd())),
            SlaveReply::Handshake(false)
        );

        assert_eq!(
            slave.handle(SlaveRequest::Read(3)),
            SlaveReply::Read(Some(BytesMut::from(&b"pay"[..])))
        );
        assert_eq!(
            slave.handle(SlaveRequest::Write(BytesMut::from(&b"file"[..]))),
            SlaveReply::Write(Some(4))
        );
        assert_eq!(slave.handle(SlaveRequest::Close), SlaveReply::Close(true));
        assert_eq!(&data_out.borrow()[..], b"file<close>");
    }

    #[test]
    fn test_client_round_trip() {
        let (slave, channel, control_out, _) = slave(b"NOOP\r\n");

        let client = thread::spawn(move || {
            let client = SlaveClient::new(&channel);
            let line = client.get_user_cmd().unwrap();
            assert_eq!(line.as_deref(), Some(&b"NOOP\r\n"[..]));
            assert!(client.write_user_resp(b"200 NOOP ok.\r\n").unwrap());
            assert_eq!(client.read(10).unwrap(), None);
            assert_eq!(client.write(b"x").unwrap(), None);
        });

        slave.run().unwrap();
        client.join().unwrap();
        assert_eq!(&control_out.borrow()[..], b"200 NOOP ok.\r\n<close>");
    }

    #[test]
    fn test_oversized_read_request() {
        let (parent, child) = Channel::pair().unwrap();
        child.send_cmd(SlaveCommand::Read).unwrap();
        child.send_int(Channel::MAX_BUFFER as i32 + 1).unwrap();
        assert!(matches!(
            SlaveRequest::recv(&parent),
            Err(Error::BufferTooLarge(_, _))
        ));
    }
}
