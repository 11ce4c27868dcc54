//! Networking for the private channels, descriptor passing and the
//! privileged data sockets.

mod ancillary;
mod fd;
pub mod socket;

pub use ancillary::{recv_fd, send_fd};
pub use fd::Fd;
pub(crate) use fd::set_cloexec;
