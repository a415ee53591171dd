use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use russ_wire::Credentials;
use russ_wire::Request;
use tracing::debug;
use tracing::trace;

use crate::deadline::Deadline;
use crate::socket;
use crate::Error;
use crate::Result;

/// Auxiliary descriptors per connection (stdin, stdout, stderr analogues).
pub const NFDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Dialing,
    Answered,
    ExchangingFds,
    Open,
    Closed,
}

/// One end of a dialed service call.
///
/// The connection owns its socket and auxiliary descriptors; they are
/// closed on [`close`](Self::close), [`release`](Self::release) or drop.
/// Request and credentials stay readable after `close`.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: ConnState,
    socket: Option<UnixStream>,
    credentials: Option<Credentials>,
    request: Option<Request>,
    fds: [Option<OwnedFd>; NFDS],
}

impl Connection {
    pub(crate) fn dialing(socket: UnixStream) -> Self {
        Self {
            role: Role::Client,
            state: ConnState::Dialing,
            socket: Some(socket),
            credentials: None,
            request: None,
            fds: [None, None, None],
        }
    }

    pub(crate) fn answered(socket: UnixStream, credentials: Credentials, request: Request) -> Self {
        Self {
            role: Role::Server,
            state: ConnState::Answered,
            socket: Some(socket),
            credentials: Some(credentials),
            request: Some(request),
            fds: [None, None, None],
        }
    }

    #[cfg(test)]
    pub(crate) fn socket(&self) -> Option<&UnixStream> {
        self.socket.as_ref()
    }

    /// Marks a dialed connection open once its request has been answered.
    pub(crate) fn mark_open(&mut self, request: Request) {
        self.request = Some(request);
        self.state = ConnState::Open;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn credentials(&self) -> Result<Credentials> {
        self.credentials.ok_or(Error::NotAnswered)
    }

    pub fn request(&self) -> Result<&Request> {
        self.request.as_ref().ok_or(Error::WrongRole(self.role))
    }

    fn slot(index: usize) -> Result<usize> {
        if index < NFDS {
            Ok(index)
        } else {
            Err(Error::InvalidIndex(index))
        }
    }

    /// Borrows auxiliary descriptor `index`; `None` if the slot is empty.
    pub fn descriptor(&self, index: usize) -> Result<Option<BorrowedFd<'_>>> {
        let i = Self::slot(index)?;
        Ok(self.fds[i].as_ref().map(|fd| fd.as_fd()))
    }

    /// Moves auxiliary descriptor `index` out of the connection.
    pub fn take_descriptor(&mut self, index: usize) -> Result<Option<OwnedFd>> {
        let i = Self::slot(index)?;
        Ok(self.fds[i].take())
    }

    pub fn close_descriptor(&mut self, index: usize) -> Result<()> {
        let i = Self::slot(index)?;
        self.fds[i] = None;
        Ok(())
    }

    /// Closes the socket and all descriptors. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.socket = None;
        self.fds = [None, None, None];
        self.state = ConnState::Closed;
        trace!(role = ?self.role, "Connection closed");
    }

    /// Closes the connection and consumes it.
    pub fn release(mut self) {
        self.close();
    }

    fn expect_state(&self, expected: ConnState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Completes an answered connection: hands `client` to the dialer and
    /// keeps `server` as this connection's auxiliary descriptors.
    ///
    /// # Panics
    ///
    /// Panics when called on a client connection.
    pub fn accept(&mut self, client: [OwnedFd; NFDS], server: [OwnedFd; NFDS]) -> Result<()> {
        assert_eq!(
            self.role,
            Role::Server,
            "accept is only valid on an answered server connection"
        );
        self.expect_state(ConnState::Answered)?;
        let stream = self.socket.as_ref().ok_or(Error::ConnectionClosed)?;

        self.state = ConnState::ExchangingFds;
        let borrowed = [client[0].as_fd(), client[1].as_fd(), client[2].as_fd()];
        if let Err(e) = socket::send_fds(stream, &borrowed) {
            self.close();
            return Err(Error::on_timeout(e, Error::ExchangeTimeout));
        }
        // the peer holds its own copies now
        drop(client);

        let [s0, s1, s2] = server;
        self.fds = [Some(s0), Some(s1), Some(s2)];
        self.state = ConnState::Open;
        debug!("Connection accepted");
        Ok(())
    }

    /// [`accept`](Self::accept) with a fresh pipe per slot: the dialer writes
    /// slot 0 and reads slots 1 and 2, the server the other way round.
    pub fn accept_with_pipes(&mut self) -> Result<()> {
        let (stdin_r, stdin_w) = socket::make_pipe()?;
        let (stdout_r, stdout_w) = socket::make_pipe()?;
        let (stderr_r, stderr_w) = socket::make_pipe()?;
        self.accept([stdin_w, stdout_r, stderr_r], [stdin_r, stdout_w, stderr_w])
    }

    /// Waits for the server's descriptor set on a dialed connection.
    ///
    /// # Panics
    ///
    /// Panics when called on a server connection.
    pub fn await_descriptors(&mut self, timeout: Duration) -> Result<()> {
        assert_eq!(
            self.role,
            Role::Client,
            "await_descriptors is only valid on a dialed client connection"
        );
        self.expect_state(ConnState::Open)?;
        if self.fds.iter().any(Option::is_some) {
            return Err(Error::Protocol("descriptors already received".to_string()));
        }
        let stream = self.socket.as_ref().ok_or(Error::ConnectionClosed)?;

        let received = socket::recv_fds(stream, NFDS, Deadline::after(timeout))
            .map_err(|e| Error::on_timeout(e, Error::ExchangeTimeout))?;
        let count = received.len();
        let fds: [OwnedFd; NFDS] = received
            .try_into()
            .map_err(|_| Error::IncompleteExchange { received: count })?;

        let [f0, f1, f2] = fds;
        self.fds = [Some(f0), Some(f1), Some(f2)];
        debug!("Descriptors received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::io::Write;

    fn answered_pair() -> (Connection, Connection) {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let request = Request::new("/", "ping");
        let cred = socket::peer_credentials(&server_sock).unwrap();

        let mut client = Connection::dialing(client_sock);
        client.mark_open(request.clone());
        let server = Connection::answered(server_sock, cred, request);
        (client, server)
    }

    #[test]
    fn test_invalid_index() {
        let (mut client, _server) = answered_pair();
        for i in [3usize, 4, 100, usize::MAX] {
            assert!(matches!(client.descriptor(i), Err(Error::InvalidIndex(n)) if n == i));
            assert!(matches!(client.take_descriptor(i), Err(Error::InvalidIndex(_))));
            assert!(matches!(client.close_descriptor(i), Err(Error::InvalidIndex(_))));
        }
    }

    #[test]
    fn test_slots_absent_until_accept() {
        let (client, server) = answered_pair();
        for i in 0..NFDS {
            assert!(client.descriptor(i).unwrap().is_none());
            assert!(server.descriptor(i).unwrap().is_none());
        }
        assert_eq!(server.request().unwrap().operation, "ping");
        assert!(server.credentials().is_ok());
    }

    #[test]
    fn test_client_has_no_credentials() {
        let (client, _server) = answered_pair();
        assert!(matches!(client.credentials(), Err(Error::NotAnswered)));
        assert_eq!(client.role(), Role::Client);
    }

    #[test]
    fn test_request_before_attach_is_wrong_role() {
        let (sock, _peer) = UnixStream::pair().unwrap();
        let conn = Connection::dialing(sock);
        assert!(matches!(conn.request(), Err(Error::WrongRole(Role::Client))));
    }

    #[test]
    fn test_accept_with_pipes_connects_both_ends() {
        let (mut client, mut server) = answered_pair();
        server.accept_with_pipes().unwrap();
        assert_eq!(server.state(), ConnState::Open);
        client.await_descriptors(Duration::from_secs(5)).unwrap();

        // client writes stdin, server reads it and answers on stdout
        let mut stdin = File::from(client.take_descriptor(0).unwrap().unwrap());
        stdin.write_all(b"hello").unwrap();
        drop(stdin);

        let mut server_in = File::from(server.take_descriptor(0).unwrap().unwrap());
        let mut got = String::new();
        server_in.read_to_string(&mut got).unwrap();
        assert_eq!(got, "hello");

        let mut server_out = File::from(server.take_descriptor(1).unwrap().unwrap());
        server_out.write_all(b"world").unwrap();
        drop(server_out);
        server.release();

        let mut stdout = File::from(client.take_descriptor(1).unwrap().unwrap());
        let mut reply = String::new();
        stdout.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "world");
    }

    #[test]
    fn test_accept_twice_is_invalid_state() {
        let (_client, mut server) = answered_pair();
        server.accept_with_pipes().unwrap();
        let err = server.accept_with_pipes().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                expected: ConnState::Answered,
                actual: ConnState::Open
            }
        ));
    }

    #[test]
    #[should_panic(expected = "accept is only valid")]
    fn test_accept_on_client_panics() {
        let (mut client, _server) = answered_pair();
        let _ = client.accept_with_pipes();
    }

    #[test]
    fn test_server_release_without_accept_is_incomplete_exchange() {
        let (mut client, server) = answered_pair();
        server.release();
        let err = client.await_descriptors(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::IncompleteExchange { received: 0 }));
        for i in 0..NFDS {
            assert!(client.descriptor(i).unwrap().is_none());
        }
    }

    #[test]
    fn test_partial_descriptor_set_is_incomplete_exchange() {
        let (mut client, server) = answered_pair();
        let (r, _w) = socket::make_pipe().unwrap();
        socket::send_fds(server.socket().unwrap(), &[r.as_fd()]).unwrap();

        let err = client.await_descriptors(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::IncompleteExchange { received: 1 }));
        assert!(client.descriptor(0).unwrap().is_none());
    }

    #[test]
    fn test_await_descriptors_times_out() {
        let (mut client, _server) = answered_pair();
        let err = client
            .await_descriptors(Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::ExchangeTimeout));
    }

    #[test]
    fn test_close_is_idempotent_and_keeps_fields() {
        let (_client, mut server) = answered_pair();
        server.accept_with_pipes().unwrap();
        server.close_descriptor(1).unwrap();
        server.close_descriptor(1).unwrap();
        assert!(server.descriptor(1).unwrap().is_none());

        server.close();
        server.close();
        assert_eq!(server.state(), ConnState::Closed);
        assert!(server.socket().is_none());
        assert!(server.descriptor(0).unwrap().is_none());
        assert_eq!(server.request().unwrap().operation, "ping");
        assert!(server.credentials().is_ok());
    }
}
