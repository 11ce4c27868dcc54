use ftp_privsep::{net::Fd, Channel, Error};
use nix::unistd::{pipe, read, write};
use std::{os::unix::io::AsRawFd, thread};

#[test]
fn test_buffer_framing() -> Result<(), Error> {
    let (parent, child) = Channel::pair()?;

    let sizes = [0, 1, 4095, 4096, 65535, Channel::MAX_BUFFER];
    let sender = thread::spawn(move || -> Result<(), Error> {
        for size in sizes.iter() {
            let buf: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
            child.send_buf(&buf)?;
        }
        Ok(())
    });

    for size in sizes.iter() {
        let buf = parent.recv_buf(Channel::MAX_BUFFER)?;
        assert_eq!(buf.len(), *size);
        assert!(buf.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }
    sender.join().expect("sender panicked")?;

    Ok(())
}

#[test]
fn test_oversized_buffer() -> Result<(), Error> {
    let (parent, child) = Channel::pair()?;

    let buf = vec![0u8; Channel::MAX_BUFFER + 1];
    assert!(matches!(child.send_buf(&buf), Err(Error::BufferTooLarge(..))));

    // A peer announcing more than the receiver allows is rejected
    // before the body is read; the body stays in the socket.
    child.send_int(128)?;
    child.send_cmd(42u8)?;
    assert!(matches!(
        parent.recv_buf(64),
        Err(Error::BufferTooLarge(128, 64))
    ));
    assert_eq!(parent.recv_cmd()?, Some(42));

    child.send_int(-1)?;
    assert!(matches!(
        parent.recv_buf(Channel::MAX_BUFFER),
        Err(Error::BufferTooLarge(-1, _))
    ));

    Ok(())
}

#[test]
fn test_short_message() -> Result<(), Error> {
    let (parent, child) = Channel::pair()?;
    child.send_int(16)?;
    drop(child);
    assert!(matches!(
        parent.recv_buf(Channel::MAX_BUFFER),
        Err(Error::ShortMessage)
    ));

    Ok(())
}

#[test]
fn test_fd_passing() -> Result<(), Error> {
    let (parent, child) = Channel::pair()?;
    let (r, w) = pipe()?;
    let (reader, writer) = (Fd::from(r), Fd::from(w));

    child.send_str("pipe")?;
    child.send_fd(&writer)?;
    drop(writer);

    assert_eq!(parent.recv_str()?, "pipe");
    let writer = parent.recv_fd()?;
    write(writer.as_raw_fd(), b"ok")?;

    let mut buf = [0u8; 2];
    assert_eq!(read(reader.as_raw_fd(), &mut buf)?, 2);
    assert_eq!(&buf, b"ok");

    Ok(())
}

#[test]
fn test_channel_across_fork() -> Result<(), Error> {
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };

    let mut channel = Channel::new()?;
    match unsafe { fork() }? {
        ForkResult::Child => {
            let code = match channel.set_child_context() {
                Ok(()) if channel.send_int(7).is_ok() => 0,
                _ => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            channel.set_parent_context()?;
            assert_eq!(channel.recv_int()?, 7);
            // The child closed its end, our copy of it is closed too.
            assert_eq!(channel.recv_cmd()?, None);
            assert_eq!(waitpid(child, None)?, WaitStatus::Exited(child, 0));
        }
    }

    Ok(())
}
