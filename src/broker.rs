//! Requests to the privileged parent and its replies.
//!
//! Each request is a one byte [`PrivCommand`] followed by its fixed
//! arguments; the reply shape is determined by the command that was
//! sent, so [`PrivReply::recv`] needs to know it.

use crate::{channel::Channel, error::Error, net::Fd};
use ftp_privsep_derive::Tag;
use std::convert::TryFrom;

/// Commands understood by the privileged executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Tag)]
#[repr(u8)]
pub enum PrivCommand {
    Login = 1,
    Chown = 2,
    GetDataSock = 3,
    PasvCleanup = 10,
    PasvActive = 11,
    PasvListen = 12,
    PasvAccept = 13,
}

/// One byte result of a privileged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Tag)]
#[repr(u8)]
pub enum PrivResult {
    Ok = 1,
    Bad = 2,
}

impl From<bool> for PrivResult {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Ok
        } else {
            Self::Bad
        }
    }
}

/// Why no passive data connection was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// No connection within the accept timeout, or no listener.
    Failed,
    /// The connection came from another host than the control peer.
    ForeignPeer,
}

impl AcceptFailure {
    fn code(self) -> i32 {
        match self {
            Self::Failed => -1,
            Self::ForeignPeer => -2,
        }
    }

    fn from_code(code: i32) -> Result<Self, Error> {
        match code {
            -1 => Ok(Self::Failed),
            -2 => Ok(Self::ForeignPeer),
            _ => Err(Error::ShortMessage),
        }
    }
}

impl From<AcceptFailure> for Error {
    fn from(failure: AcceptFailure) -> Self {
        match failure {
            AcceptFailure::Failed => Error::Timeout,
            AcceptFailure::ForeignPeer => Error::ForeignPeer,
        }
    }
}

#[derive(Debug)]
pub enum PrivRequest {
    Login {
        user: String,
        pass: String,
        control_ssl: bool,
        data_ssl: bool,
    },
    /// Connect a data socket from the local control address to the
    /// remote control address at `port`.
    GetDataSock {
        port: u16,
    },
    /// Re-own an uploaded file.
    Chown(Fd),
    PasvCleanup,
    PasvActive,
    PasvListen,
    PasvAccept,
}

impl PrivRequest {
    pub fn command(&self) -> PrivCommand {
        match self {
            Self::Login { .. } => PrivCommand::Login,
            Self::GetDataSock { .. } => PrivCommand::GetDataSock,
            Self::Chown(_) => PrivCommand::Chown,
            Self::PasvCleanup => PrivCommand::PasvCleanup,
            Self::PasvActive => PrivCommand::PasvActive,
            Self::PasvListen => PrivCommand::PasvListen,
            Self::PasvAccept => PrivCommand::PasvAccept,
        }
    }

    pub fn send(&self, channel: &Channel) -> Result<(), Error> {
        channel.send_cmd(self.command())?;
        match self {
            Self::Login {
                user,
                pass,
                control_ssl,
                data_ssl,
            } => {
                channel.send_str(user)?;
                channel.send_str(pass)?;
                channel.send_int(*control_ssl as i32)?;
                channel.send_int(*data_ssl as i32)
            }
            Self::GetDataSock { port } => channel.send_int(i32::from(*port)),
            Self::Chown(fd) => channel.send_fd(fd),
            Self::PasvCleanup | Self::PasvActive | Self::PasvListen | Self::PasvAccept => Ok(()),
        }
    }

    /// Receive the next request, or `None` if the peer closed the channel.
    pub fn recv(channel: &Channel) -> Result<Option<Self>, Error> {
        let tag = match channel.recv_cmd()? {
            Some(tag) => tag,
            None => return Ok(None),
        };
        let command = PrivCommand::try_from(tag).map_err(Error::UnexpectedCommand)?;

        let request = match command {
            PrivCommand::Login => Self::Login {
                user: channel.recv_str()?,
                pass: channel.recv_str()?,
                control_ssl: channel.recv_int()? != 0,
                data_ssl: channel.recv_int()? != 0,
            },
            PrivCommand::GetDataSock => {
                let port = channel.recv_int()?;
                Self::GetDataSock {
                    port: u16::try_from(port).map_err(|_| Error::Rejected("data port"))?,
                }
            }
            PrivCommand::Chown => Self::Chown(channel.recv_fd()?),
            PrivCommand::PasvCleanup => Self::PasvCleanup,
            PrivCommand::PasvActive => Self::PasvActive,
            PrivCommand::PasvListen => Self::PasvListen,
            PrivCommand::PasvAccept => Self::PasvAccept,
        };

        Ok(Some(request))
    }
}

#[derive(Debug)]
pub enum PrivReply {
    Login(bool),
    /// A connected data socket, if the connect succeeded.
    DataSock(Option<Fd>),
    Chown(bool),
    PasvCleanup,
    PasvActive(bool),
    /// The port of the new passive listener.
    PasvListen(u16),
    PasvAccept(Result<Fd, AcceptFailure>),
}

impl PrivReply {
    pub fn send(&self, channel: &Channel) -> Result<(), Error> {
        match self {
            Self::Login(ok) | Self::Chown(ok) => channel.send_cmd(PrivResult::from(*ok)),
            Self::DataSock(None) => channel.send_cmd(PrivResult::Bad),
            Self::DataSock(Some(fd)) => {
                channel.send_cmd(PrivResult::Ok)?;
                channel.send_fd(fd)
            }
            Self::PasvCleanup => channel.send_int(0),
            Self::PasvActive(active) => channel.send_int(*active as i32),
            Self::PasvListen(port) => channel.send_int(i32::from(*port)),
            Self::PasvAccept(Ok(fd)) => {
                channel.send_int(0)?;
                channel.send_fd(fd)
            }
            Self::PasvAccept(Err(failure)) => channel.send_int(failure.code()),
        }
    }

    /// Receive the reply to `command`.
    pub fn recv(channel: &Channel, command: PrivCommand) -> Result<Self, Error> {
        let reply = match command {
            PrivCommand::Login => Self::Login(recv_result(channel)?),
            PrivCommand::Chown => Self::Chown(recv_result(channel)?),
            PrivCommand::GetDataSock => match recv_result(channel)? {
                true => Self::DataSock(Some(channel.recv_fd()?)),
                false => Self::DataSock(None),
            },
            PrivCommand::PasvCleanup => {
                channel.recv_int()?;
                Self::PasvCleanup
            }
            PrivCommand::PasvActive => Self::PasvActive(channel.recv_int()? != 0),
            PrivCommand::PasvListen => {
                let port = channel.recv_int()?;
                Self::PasvListen(u16::try_from(port).map_err(|_| Error::ShortMessage)?)
            }
            PrivCommand::PasvAccept => match channel.recv_int()? {
                0 => Self::PasvAccept(Ok(channel.recv_fd()?)),
                code => Self::PasvAccept(Err(AcceptFailure::from_code(code)?)),
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

/// Send one request and block for its reply.
pub fn call(channel: &Channel, request: &PrivRequest) -> Result<PrivReply, Error> {
    request.send(channel)?;
    PrivReply::recv(channel, request.command())
}
