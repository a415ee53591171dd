#![deny(clippy::all)]

mod attributes;
mod codec;
mod credentials;
mod error;
mod request;

pub use attributes::Attributes;
pub use codec::DecodeOptions;
pub use codec::decode_credentials;
pub use codec::decode_request;
pub use codec::encode_credentials;
pub use codec::encode_request;
pub use codec::CREDENTIALS_LEN;
pub use codec::FRAME_HEADER_LEN;
pub use credentials::Credentials;
pub use error::WireError;
pub use request::Request;

/// Protocol string carried at the head of every request.
pub const PROTOCOL_STRING: &str = "0004";

pub const MAX_ATTRC: usize = 1024;
pub const MAX_ARGC: usize = 1024;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub type Result<T> = std::result::Result<T, WireError>;
