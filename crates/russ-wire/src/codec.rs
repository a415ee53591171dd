//! Binary framing for requests and credentials.
//!
//! All integers are little-endian. A request frame is a `u32` body length
//! followed by the body:
//!
//! ```text
//! string protocol_string
//! string service_path
//! string operation
//! u32 attrc, attrc x string ("key=value")
//! u32 argc,  argc  x string
//! ```
//!
//! A string is a `u32` length (counting a trailing NUL) followed by the bytes
//! and the NUL. Sequences are always counted; an empty sequence is a zero
//! count and nothing else.

use crate::Attributes;
use crate::Credentials;
use crate::Request;
use crate::Result;
use crate::WireError;
use crate::{MAX_ARGC, MAX_ATTRC, MAX_REQUEST_BYTES};

pub const FRAME_HEADER_LEN: usize = 4;
pub const CREDENTIALS_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Fail on `key=value` entries without `=` instead of skipping them.
    pub strict_attributes: bool,
    pub max_attrc: usize,
    pub max_argc: usize,
    pub max_request_bytes: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            strict_attributes: false,
            max_attrc: MAX_ATTRC,
            max_argc: MAX_ARGC,
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }
}

impl DecodeOptions {
    pub fn strict() -> Self {
        Self {
            strict_attributes: true,
            ..Self::default()
        }
    }

    /// Validates a frame header and returns the body length it announces.
    pub fn body_len(&self, header: [u8; FRAME_HEADER_LEN]) -> Result<usize> {
        let size = u32::from_le_bytes(header) as usize;
        if size > self.max_request_bytes {
            return Err(WireError::MessageTooLarge {
                size,
                max: self.max_request_bytes,
            });
        }
        Ok(size)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        self.put_u32((s.len() + 1) as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn put_strs<I, S>(&mut self, count: usize, items: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.put_u32(count as u32);
        for item in items {
            self.put_str(item.as_ref());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(WireError::truncated(n, self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        match bytes.split_last() {
            Some((0, body)) => std::str::from_utf8(body)
                .map(str::to_owned)
                .map_err(|_| WireError::InvalidString("not valid UTF-8")),
            Some(_) => Err(WireError::InvalidString("missing NUL terminator")),
            None => Err(WireError::InvalidString("zero length")),
        }
    }

    /// Reads a sequence count, rejecting counts the remaining bytes cannot hold.
    fn count(&mut self, what: &'static str, max: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(WireError::TooManyEntries { what, count, max });
        }
        // every entry carries at least its 4-byte length
        let needed = count.saturating_mul(4);
        if needed > self.remaining() {
            return Err(WireError::truncated(needed, self.remaining()));
        }
        Ok(count)
    }

    fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Encodes a request as a complete frame (header and body).
///
/// Attribute keys containing `=` are rejected: the decoder splits entries on
/// the first `=`, so such a key would come back altered.
pub fn encode_request(req: &Request) -> Result<Vec<u8>> {
    if let Some(key) = req.attributes.invalid_key() {
        return Err(WireError::InvalidAttributeKey(key.to_string()));
    }
    let mut w = Writer::new();
    w.put_u32(0);
    w.put_str(&req.protocol_string);
    w.put_str(&req.service_path);
    w.put_str(&req.operation);
    w.put_strs(req.attributes.len(), req.attributes.to_entries());
    w.put_strs(req.arguments.len(), &req.arguments);

    let body_len = (w.buf.len() - FRAME_HEADER_LEN) as u32;
    w.buf[..FRAME_HEADER_LEN].copy_from_slice(&body_len.to_le_bytes());
    Ok(w.buf)
}

/// Decodes a complete request frame produced by [`encode_request`].
pub fn decode_request(frame: &[u8], opts: &DecodeOptions) -> Result<Request> {
    let mut r = Reader::new(frame);
    let header = r.take(FRAME_HEADER_LEN)?;
    let body_len = opts.body_len([header[0], header[1], header[2], header[3]])?;
    if body_len > r.remaining() {
        return Err(WireError::truncated(body_len, r.remaining()));
    }
    if body_len < r.remaining() {
        return Err(WireError::TrailingBytes(r.remaining() - body_len));
    }

    let protocol_string = r.string()?;
    let service_path = r.string()?;
    let operation = r.string()?;

    let attrc = r.count("attributes", opts.max_attrc)?;
    let mut attributes = Attributes::new();
    for _ in 0..attrc {
        let entry = r.string()?;
        match Attributes::parse_entry(&entry) {
            Some((k, v)) => {
                attributes.insert(k, v);
            }
            None if opts.strict_attributes => return Err(WireError::MalformedAttribute(entry)),
            None => {}
        }
    }

    let argc = r.count("arguments", opts.max_argc)?;
    let mut arguments = Vec::with_capacity(argc);
    for _ in 0..argc {
        arguments.push(r.string()?);
    }
    r.finish()?;

    Ok(Request {
        protocol_string,
        service_path,
        operation,
        attributes,
        arguments,
    })
}

pub fn encode_credentials(cred: &Credentials) -> [u8; CREDENTIALS_LEN] {
    let mut buf = [0u8; CREDENTIALS_LEN];
    buf[0..4].copy_from_slice(&cred.pid.to_le_bytes());
    buf[4..8].copy_from_slice(&cred.uid.to_le_bytes());
    buf[8..12].copy_from_slice(&cred.gid.to_le_bytes());
    buf
}

pub fn decode_credentials(buf: &[u8]) -> Result<Credentials> {
    let mut r = Reader::new(buf);
    let pid = r.i32()?;
    let uid = r.u32()?;
    let gid = r.u32()?;
    r.finish()?;
    Ok(Credentials { pid, uid, gid })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    fn raw_str(s: &str) -> Vec<u8> {
        let mut out = ((s.len() + 1) as u32).to_le_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out.push(0);
        out
    }

    fn body_with_attrs(entries: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(raw_str("0004"));
        body.extend(raw_str("/"));
        body.extend(raw_str("op"));
        body.extend((entries.len() as u32).to_le_bytes());
        for e in entries {
            body.extend(raw_str(e));
        }
        body.extend(0u32.to_le_bytes());
        body
    }

    #[test]
    fn test_empty_sequences_encode_as_zero_count() {
        let req = Request::new("/", "ping");
        let frame = encode_request(&req).unwrap();

        // header + 3 strings + two zero counts
        let strings = raw_str("0004").len() + raw_str("/").len() + raw_str("ping").len();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + strings + 8);
        assert_eq!(&frame[frame.len() - 8..], &[0u8; 8]);

        let decoded = decode_request(&frame, &DecodeOptions::default()).unwrap();
        assert!(decoded.attributes.is_empty());
        assert!(decoded.arguments.is_empty());
    }

    #[test]
    fn test_attribute_splits_on_first_equals() {
        let frame = raw_frame(&body_with_attrs(&["k=v=extra"]));
        let req = decode_request(&frame, &DecodeOptions::strict()).unwrap();
        assert_eq!(req.attributes, Attributes::from([("k", "v=extra")]));
    }

    #[test]
    fn test_encode_rejects_key_with_equals() {
        let req = Request::new("/", "op").with_attributes(Attributes::from([("a=b", "c")]));
        let err = encode_request(&req).unwrap_err();
        assert!(matches!(err, WireError::InvalidAttributeKey(ref k) if k == "a=b"));

        // '=' in the value is fine
        let req = Request::new("/", "op").with_attributes(Attributes::from([("a", "b=c")]));
        let frame = encode_request(&req).unwrap();
        assert_eq!(decode_request(&frame, &DecodeOptions::strict()).unwrap(), req);
    }

    #[test]
    fn test_duplicate_attribute_last_write_wins() {
        let frame = raw_frame(&body_with_attrs(&["a=1", "b=2", "a=3"]));
        let req = decode_request(&frame, &DecodeOptions::default()).unwrap();
        let pairs: Vec<_> = req.attributes.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_malformed_attribute_lenient_skips() {
        let frame = raw_frame(&body_with_attrs(&["good=1", "novalue", "also=2"]));
        let req = decode_request(&frame, &DecodeOptions::default()).unwrap();
        assert_eq!(req.attributes, Attributes::from([("good", "1"), ("also", "2")]));
    }

    #[test]
    fn test_malformed_attribute_strict_fails() {
        let frame = raw_frame(&body_with_attrs(&["good=1", "novalue"]));
        let err = decode_request(&frame, &DecodeOptions::strict()).unwrap_err();
        assert_eq!(err, WireError::MalformedAttribute("novalue".to_string()));
    }

    #[test]
    fn test_count_exceeding_bytes_is_truncated() {
        let mut body = Vec::new();
        body.extend(raw_str("0004"));
        body.extend(raw_str("/"));
        body.extend(raw_str("op"));
        body.extend(50u32.to_le_bytes());
        body.extend(raw_str("a=1"));
        let err = decode_request(&raw_frame(&body), &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, WireError::TruncatedMessage { .. }));
    }

    #[test]
    fn test_short_frame_is_truncated() {
        let frame = encode_request(&Request::new("/", "ping").with_arguments(["x"])).unwrap();
        let err = decode_request(&frame[..frame.len() - 3], &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, WireError::TruncatedMessage { .. }));

        let err = decode_request(&frame[..2], &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, WireError::TruncatedMessage { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = encode_request(&Request::new("/", "ping")).unwrap();
        frame.push(0xff);
        let err = decode_request(&frame, &DecodeOptions::default()).unwrap_err();
        assert_eq!(err, WireError::TrailingBytes(1));
    }

    #[test]
    fn test_string_without_terminator() {
        let mut body = Vec::new();
        body.extend(4u32.to_le_bytes());
        body.extend(b"0004");
        let err = decode_request(&raw_frame(&body), &DecodeOptions::default()).unwrap_err();
        assert_eq!(err, WireError::InvalidString("missing NUL terminator"));
    }

    #[test]
    fn test_too_many_arguments() {
        let opts = DecodeOptions {
            max_argc: 2,
            ..DecodeOptions::default()
        };
        let frame =
            encode_request(&Request::new("/", "op").with_arguments(["a", "b", "c"])).unwrap();
        let err = decode_request(&frame, &opts).unwrap_err();
        assert_eq!(
            err,
            WireError::TooManyEntries {
                what: "arguments",
                count: 3,
                max: 2
            }
        );
    }

    #[test]
    fn test_body_len_limit() {
        let opts = DecodeOptions {
            max_request_bytes: 16,
            ..DecodeOptions::default()
        };
        assert_eq!(opts.body_len(16u32.to_le_bytes()).unwrap(), 16);
        assert!(matches!(
            opts.body_len(17u32.to_le_bytes()),
            Err(WireError::MessageTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_credentials_codec() {
        let cred = Credentials::new(-1, 1000, 100);
        let bytes = encode_credentials(&cred);
        assert_eq!(decode_credentials(&bytes).unwrap(), cred);

        assert!(matches!(
            decode_credentials(&bytes[..7]),
            Err(WireError::TruncatedMessage { .. })
        ));
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(decode_credentials(&long), Err(WireError::TrailingBytes(1)));
    }
}
