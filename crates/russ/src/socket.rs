//! Thin wrappers over the socket facilities the protocol needs: descriptor
//! passing, peer credentials, readiness polling and deadline-bounded I/O.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use russ_wire::Credentials;

use crate::deadline::Deadline;

/// Payload byte accompanying an SCM_RIGHTS message; ancillary data needs at
/// least one byte of regular data to ride on.
const FDS_MARKER: u8 = b'F';

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[allow(unused_unsafe)]
fn control_space(nfds: usize) -> usize {
    // SAFETY: pure size computation.
    unsafe { libc::CMSG_SPACE((nfds * mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// Sends `fds` in a single SCM_RIGHTS message.
pub(crate) fn send_fds(stream: &UnixStream, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    let payload = [FDS_MARKER];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let space = control_space(fds.len());
    // u64 backing keeps the control buffer aligned for cmsghdr
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    // SAFETY: msghdr is plain data; every pointer stored in it refers to
    // `iov`, `payload` or `control`, which outlive the sendmsg call, and the
    // control buffer holds CMSG_SPACE bytes for exactly `fds.len()` descriptors.
    let sent = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as libc::c_uint) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
        for (i, fd) in fds.iter().enumerate() {
            data.add(i).write_unaligned(fd.as_raw_fd());
        }

        loop {
            let rc = libc::sendmsg(stream.as_raw_fd(), &msg, SEND_FLAGS);
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    };

    if sent == 0 {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "sendmsg wrote nothing"));
    }
    Ok(())
}

/// Receives one SCM_RIGHTS message carrying at most `max` descriptors.
///
/// Returns an empty vector when the peer closed the socket. Descriptors
/// beyond `max` are discarded by the kernel.
pub(crate) fn recv_fds(
    stream: &UnixStream,
    max: usize,
    deadline: Deadline,
) -> io::Result<Vec<OwnedFd>> {
    stream.set_read_timeout(deadline.socket_timeout()?)?;

    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let space = control_space(max);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut fds = Vec::with_capacity(max);
    // SAFETY: as in send_fds; received descriptors are wrapped in OwnedFd
    // exactly once, immediately after they are read from the control buffer.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = loop {
            let rc = libc::recvmsg(stream.as_raw_fd(), &mut msg, RECV_FLAGS);
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        if received == 0 {
            return Ok(fds);
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(fds)
}

/// Credentials of the process on the other end of `stream`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn peer_credentials(stream: &UnixStream) -> io::Result<Credentials> {
    // SAFETY: getsockopt writes at most `len` bytes into `cred`.
    unsafe {
        let mut cred: libc::ucred = mem::zeroed();
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        );
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Credentials::new(cred.pid, cred.uid, cred.gid))
    }
}

/// Credentials of the process on the other end of `stream`.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn peer_credentials(stream: &UnixStream) -> io::Result<Credentials> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: getpeereid only writes the two out parameters.
    let rc = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Credentials::new(-1, uid, gid))
}

fn poll_one(fd: BorrowedFd<'_>, events: libc::c_short, deadline: Deadline) -> io::Result<bool> {
    loop {
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, deadline.poll_millis()) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Waits until `fd` is readable (or hung up). Returns `false` on deadline expiry.
pub(crate) fn poll_readable(fd: BorrowedFd<'_>, deadline: Deadline) -> io::Result<bool> {
    poll_one(fd, libc::POLLIN, deadline)
}

/// Waits until `fd` is writable. Returns `false` on deadline expiry.
pub(crate) fn poll_writable(fd: BorrowedFd<'_>, deadline: Deadline) -> io::Result<bool> {
    poll_one(fd, libc::POLLOUT, deadline)
}

/// Pause between connect attempts while the listener's backlog is full.
const CONNECT_RETRY: Duration = Duration::from_millis(5);

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain data; all zeroes is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path contains NUL"));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn unix_socket() -> io::Result<OwnedFd> {
    // SAFETY: socket(2) returns a fresh descriptor that is wrapped exactly once.
    let fd = unsafe {
        let raw = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(raw)
    };
    // SAFETY: fcntl on a descriptor we own.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn take_socket_error(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut code: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: getsockopt writes at most `len` bytes into `code`.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    match code {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Connects to the socket at `path`, failing with `TimedOut` once `deadline`
/// passes. The returned stream is blocking.
///
/// A full backlog makes a non-blocking connect fail with `EAGAIN` on Linux
/// and `EINPROGRESS` elsewhere; the first is retried, the second polled.
pub(crate) fn connect_deadline(path: &Path, deadline: Deadline) -> io::Result<UnixStream> {
    let (addr, len) = unix_sockaddr(path)?;
    let stream = UnixStream::from(unix_socket()?);
    stream.set_nonblocking(true)?;

    loop {
        // SAFETY: `addr` is a valid sockaddr_un of `len` bytes.
        let rc = unsafe {
            libc::connect(
                stream.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EINPROGRESS) => {
                if !poll_writable(stream.as_fd(), deadline)? {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
                take_socket_error(stream.as_fd())?;
                break;
            }
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                if deadline.is_expired() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
                thread::sleep(CONNECT_RETRY.min(deadline.remaining()));
            }
            _ => return Err(err),
        }
    }

    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Creates a close-on-exec pipe, returning `(read, write)` ends.
pub fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut raw: [RawFd; 2] = [-1; 2];
    // SAFETY: pipe fills both slots on success; each is wrapped exactly once.
    let (read, write) = unsafe {
        if libc::pipe(raw.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        (OwnedFd::from_raw_fd(raw[0]), OwnedFd::from_raw_fd(raw[1]))
    };
    for fd in [&read, &write] {
        // SAFETY: fcntl on a descriptor we own.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

pub(crate) fn write_all_deadline(
    stream: &UnixStream,
    buf: &[u8],
    deadline: Deadline,
) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        stream.set_write_timeout(deadline.socket_timeout()?)?;
        match (&*stream).write(&buf[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed")),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn read_exact_deadline(
    stream: &UnixStream,
    buf: &mut [u8],
    deadline: Deadline,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.set_read_timeout(deadline.socket_timeout()?)?;
        match (&*stream).read(&mut buf[filled..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "socket closed")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads `fd` to EOF, failing with `TimedOut` if the writer is still open at
/// the deadline.
pub(crate) fn read_to_string_deadline(fd: OwnedFd, deadline: Deadline) -> io::Result<String> {
    let mut file = File::from(fd);
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if !poll_readable(file.as_fd(), deadline)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "reply not complete"));
        }
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// A listening socket with an explicit backlog, for exercising full queues.
#[cfg(test)]
pub(crate) fn listen_with_backlog(
    path: &Path,
    backlog: libc::c_int,
) -> io::Result<std::os::unix::net::UnixListener> {
    let (addr, len) = unix_sockaddr(path)?;
    let fd = unix_socket()?;
    // SAFETY: `addr` is a valid sockaddr_un of `len` bytes; fd is ours.
    unsafe {
        if libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        ) < 0
            || libc::listen(fd.as_raw_fd(), backlog) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(std::os::unix::net::UnixListener::from(fd))
}

/// Opens pending connections until `path`'s backlog refuses more.
#[cfg(test)]
pub(crate) fn fill_backlog(path: &Path) -> Vec<UnixStream> {
    let mut pending = Vec::new();
    loop {
        match connect_deadline(path, Deadline::after(Duration::ZERO)) {
            Ok(stream) => pending.push(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return pending,
            Err(e) => panic!("unexpected connect error: {}", e),
        }
        assert!(pending.len() < 1024, "backlog never filled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_recv_three_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let pipes: Vec<_> = (0..3).map(|_| make_pipe().unwrap()).collect();
        let writers: Vec<_> = pipes.iter().map(|(_, w)| w.as_fd()).collect();

        send_fds(&a, &writers).unwrap();
        let received = recv_fds(&b, 3, Deadline::after(Duration::from_secs(5))).unwrap();
        assert_eq!(received.len(), 3);

        for (i, fd) in received.into_iter().enumerate() {
            let mut file = File::from(fd);
            write!(file, "slot{}", i).unwrap();
        }
        for (i, (r, w)) in pipes.into_iter().enumerate() {
            drop(w);
            let text = read_to_string_deadline(r, Deadline::after(Duration::from_secs(5))).unwrap();
            assert_eq!(text, format!("slot{}", i));
        }
    }

    #[test]
    fn test_recv_fds_peer_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let received = recv_fds(&b, 3, Deadline::after(Duration::from_secs(5))).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_recv_fds_times_out() {
        let (_a, b) = UnixStream::pair().unwrap();
        let err = recv_fds(&b, 3, Deadline::after(Duration::from_millis(30))).unwrap_err();
        assert!(crate::error::is_timeout(&err));
    }

    #[test]
    fn test_peer_credentials_match_self() {
        let (a, _b) = UnixStream::pair().unwrap();
        let cred = peer_credentials(&a).unwrap();
        // SAFETY: trivial libc getters.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        assert_eq!(cred.uid, uid);
        assert_eq!(cred.gid, gid);
        #[cfg(target_os = "linux")]
        assert_eq!(cred.pid, std::process::id() as i32);
    }

    #[test]
    fn test_poll_readable_timeout_then_ready() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let ready = poll_readable(b.as_fd(), Deadline::after(Duration::from_millis(20))).unwrap();
        assert!(!ready);

        a.write_all(b"x").unwrap();
        let ready = poll_readable(b.as_fd(), Deadline::after(Duration::from_secs(1))).unwrap();
        assert!(ready);
    }

    #[test]
    fn test_read_exact_deadline_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        write_all_deadline(&a, b"ab", Deadline::after(Duration::from_secs(1))).unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let err = read_exact_deadline(&b, &mut buf, Deadline::after(Duration::from_secs(1)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_to_string_deadline_times_out_while_writer_open() {
        let (r, _w) = make_pipe().unwrap();
        let err = read_to_string_deadline(r, Deadline::after(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_connect_deadline_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let mut stream = connect_deadline(&path, Deadline::after(Duration::from_secs(1))).unwrap();
        stream.write_all(b"x").unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_connect_deadline_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_deadline(&dir.path().join("nope"), Deadline::never()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_connect_deadline_full_backlog_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _listener = listen_with_backlog(&path, 0).unwrap();
        let _pending = fill_backlog(&path);

        let start = std::time::Instant::now();
        let err = connect_deadline(&path, Deadline::after(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_unix_sockaddr_rejects_long_path() {
        let long = "x".repeat(200);
        let err = unix_sockaddr(Path::new(&long)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
