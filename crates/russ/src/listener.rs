use std::fs;
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use russ_wire::decode_request;
use russ_wire::DecodeOptions;
use russ_wire::FRAME_HEADER_LEN;
use russ_wire::PROTOCOL_STRING;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RussConfig;
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::dialer::ANSWER_ACK;
use crate::socket;
use crate::Error;
use crate::Result;

fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering from poisoned listener lock");
        poisoned.into_inner()
    })
}

/// Server side of the transport: a socket announced at a service address.
///
/// `answer` calls are serialized, so one listener may be shared between
/// threads without two callers reading the same incoming handshake.
#[derive(Debug)]
pub struct Listener {
    path: PathBuf,
    inner: Mutex<Option<UnixListener>>,
    decode: DecodeOptions,
    request_timeout: Duration,
}

/// Removes a leftover socket file nobody listens on.
fn clear_stale_socket(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if !meta.file_type().is_socket() {
        return Err(Error::AddressInUse(path.to_path_buf()));
    }
    if UnixStream::connect(path).is_ok() {
        return Err(Error::AddressInUse(path.to_path_buf()));
    }
    debug!(path = %path.display(), "Removing stale socket");
    fs::remove_file(path).map_err(|e| Error::for_path(e, path))
}

impl Listener {
    /// Binds `path` with the given permission bits and owner.
    pub fn announce(path: impl AsRef<Path>, mode: u32, uid: u32, gid: u32) -> Result<Self> {
        let path = path.as_ref();
        clear_stale_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|e| Error::for_path(e, path))?;
        let setup = fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .and_then(|()| std::os::unix::fs::chown(path, Some(uid), Some(gid)))
            .and_then(|()| listener.set_nonblocking(true));
        if let Err(e) = setup {
            let _ = fs::remove_file(path);
            return Err(Error::for_path(e, path));
        }

        info!(path = %path.display(), mode = format!("{:o}", mode), uid, gid, "Service announced");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Some(listener)),
            decode: DecodeOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_decode_options(mut self, decode: DecodeOptions) -> Self {
        self.decode = decode;
        self
    }

    /// Bounds the read of a request once a dialer has been accepted.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Applies the decode limits and request timeout from `config`.
    pub fn with_config(self, config: &RussConfig) -> Self {
        self.with_decode_options(config.decode_options())
            .with_request_timeout(config.request_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        lock_or_recover(&self.inner).is_some()
    }

    fn accept_stream(&self, deadline: Deadline) -> Result<UnixStream> {
        let guard = lock_or_recover(&self.inner);
        let listener = guard.as_ref().ok_or(Error::ListenerClosed)?;
        loop {
            if !socket::poll_readable(listener.as_fd(), deadline)? {
                return Err(Error::AnswerTimeout);
            }
            match listener.accept() {
                Ok((stream, _addr)) => return Ok(stream),
                // a dialer may give up between poll and accept
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits up to `timeout` for a dial and reads its request.
    ///
    /// `timeout` only bounds the wait for an incoming dial. Once accepted, the
    /// dialer gets the listener's request timeout to send its frame, so a dial
    /// arriving late in the window is still answered.
    ///
    /// The returned connection is answered: request and credentials are
    /// available, no descriptor has been exchanged yet.
    pub fn answer(&self, timeout: Duration) -> Result<Connection> {
        let stream = self.accept_stream(Deadline::after(timeout))?;
        let deadline = Deadline::after(self.request_timeout);
        // Ensure accepted sockets are blocking so timeouts can be set reliably.
        stream.set_nonblocking(false)?;

        let credentials = socket::peer_credentials(&stream)?;
        let as_answer_timeout = |e| Error::on_timeout(e, Error::AnswerTimeout);

        let mut header = [0u8; FRAME_HEADER_LEN];
        socket::read_exact_deadline(&stream, &mut header, deadline).map_err(as_answer_timeout)?;
        let body_len = self.decode.body_len(header)?;

        let mut frame = vec![0u8; FRAME_HEADER_LEN + body_len];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&header);
        socket::read_exact_deadline(&stream, &mut frame[FRAME_HEADER_LEN..], deadline)
            .map_err(as_answer_timeout)?;

        let request = decode_request(&frame, &self.decode)?;
        if request.protocol_string != PROTOCOL_STRING {
            return Err(Error::Protocol(format!(
                "unsupported protocol {:?}",
                request.protocol_string
            )));
        }
        socket::write_all_deadline(&stream, &[ANSWER_ACK], deadline).map_err(as_answer_timeout)?;

        debug!(
            pid = credentials.pid,
            uid = credentials.uid,
            op = %request.operation,
            service_path = %request.service_path,
            "Answered dial"
        );
        Ok(Connection::answered(stream, credentials, request))
    }

    /// Stops answering. Idempotent; the socket file stays in place.
    pub fn close(&self) {
        if lock_or_recover(&self.inner).take().is_some() {
            debug!(path = %self.path.display(), "Listener closed");
        }
    }

    /// Closes the listener and removes its socket file.
    pub fn release(self) {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}
