use std::io;
use std::time::Duration;
use std::time::Instant;

/// Wall-clock point after which a blocking operation gives up.
///
/// Timeouts too large to represent as an `Instant` (e.g. `Duration::MAX`)
/// mean no deadline at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_bounded(&self) -> bool {
        self.0.is_some()
    }

    /// Time left; `Duration::MAX` when unbounded.
    pub fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_bounded() && self.remaining().is_zero()
    }

    /// Value for a socket timeout option: `None` blocks, zero is rejected by
    /// the OS so an expired deadline is reported as `TimedOut` instead.
    pub(crate) fn socket_timeout(&self) -> io::Result<Option<Duration>> {
        if self.0.is_none() {
            return Ok(None);
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline expired"));
        }
        Ok(Some(remaining))
    }

    /// Remaining time in whole milliseconds for `poll(2)`, rounded up; `-1`
    /// when unbounded.
    pub(crate) fn poll_millis(&self) -> libc::c_int {
        if self.0.is_none() {
            return -1;
        }
        let remaining = self.remaining();
        let millis = remaining.as_millis() + u128::from(remaining.subsec_nanos() % 1_000_000 != 0);
        millis.min(libc::c_int::MAX as u128) as libc::c_int
    }
}
