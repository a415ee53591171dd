use std::time::Duration;

use russ_wire::encode_request;
use russ_wire::Attributes;
use russ_wire::Request;
use tracing::debug;

use crate::address::resolve_target;
use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::error::is_timeout;
use crate::socket;
use crate::Error;
use crate::Result;
use crate::RussConfig;

/// Byte a server writes once it has read and accepted a request frame.
pub(crate) const ANSWER_ACK: u8 = b'A';

/// Client side of the transport.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    config: RussConfig,
}

impl Dialer {
    pub fn new(config: RussConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RussConfig {
        &self.config
    }

    /// Dials `addr` and sends a request for `op`.
    ///
    /// `timeout` bounds connecting (including a wait on a full backlog),
    /// sending the request and waiting for the server to answer it; a
    /// timeout too large for the clock waits indefinitely. The returned
    /// connection is open with empty descriptor slots; call
    /// [`Connection::await_descriptors`] to receive them once the server
    /// accepts.
    pub fn dial(
        &self,
        addr: &str,
        op: &str,
        timeout: Duration,
        attributes: Attributes,
        arguments: &[&str],
    ) -> Result<Connection> {
        let deadline = Deadline::after(timeout);
        let target = resolve_target(addr, &self.config.services_dir)?;
        let request = Request::new(target.service_path, op)
            .with_attributes(attributes)
            .with_arguments(arguments.iter().copied());

        let frame = encode_request(&request)?;
        let stream = socket::connect_deadline(&target.socket_path, deadline).map_err(|e| {
            if is_timeout(&e) {
                Error::DialTimeout
            } else {
                Error::for_path(e, &target.socket_path)
            }
        })?;

        socket::write_all_deadline(&stream, &frame, deadline)
            .map_err(|e| Error::on_timeout(e, Error::DialTimeout))?;

        let mut ack = [0u8; 1];
        socket::read_exact_deadline(&stream, &mut ack, deadline)
            .map_err(|e| Error::on_timeout(e, Error::DialTimeout))?;
        if ack[0] != ANSWER_ACK {
            return Err(Error::Protocol(format!(
                "unexpected answer byte 0x{:02x}",
                ack[0]
            )));
        }

        debug!(
            socket = %target.socket_path.display(),
            service_path = %request.service_path,
            op,
            "Dialed service"
        );
        let mut conn = Connection::dialing(stream);
        conn.mark_open(request);
        Ok(conn)
    }

    /// Dials with the configured default timeout.
    pub fn dial_default(
        &self,
        addr: &str,
        op: &str,
        attributes: Attributes,
        arguments: &[&str],
    ) -> Result<Connection> {
        self.dial(addr, op, self.config.dial_timeout, attributes, arguments)
    }

    /// One-shot call of a text-reporting operation; returns what the service
    /// wrote on its stdout channel.
    pub fn query(&self, addr: &str, op: &str, timeout: Duration) -> Result<String> {
        let deadline = Deadline::after(timeout);
        let mut conn = self.dial(addr, op, timeout, Attributes::new(), &[])?;
        conn.await_descriptors(deadline.remaining())?;
        // nothing to send: closing stdin lets the service see EOF
        conn.close_descriptor(0)?;

        let stdout = conn
            .take_descriptor(1)?
            .ok_or(Error::IncompleteExchange { received: 0 })?;
        let text = socket::read_to_string_deadline(stdout, deadline)
            .map_err(|e| Error::on_timeout(e, Error::DialTimeout));
        conn.release();
        text
    }

    pub fn help(&self, addr: &str, timeout: Duration) -> Result<String> {
        self.query(addr, "help", timeout)
    }

    pub fn info(&self, addr: &str, timeout: Duration) -> Result<String> {
        self.query(addr, "info", timeout)
    }

    pub fn list(&self, addr: &str, timeout: Duration) -> Result<String> {
        self.query(addr, "list", timeout)
    }
}
