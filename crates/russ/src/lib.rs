#![deny(clippy::all)]

mod address;
mod config;
mod connection;
mod deadline;
mod dialer;
mod error;
mod listener;
pub mod server;
mod socket;

pub use address::resolve_target;
pub use address::Target;
pub use config::RussConfig;
pub use connection::ConnState;
pub use connection::Connection;
pub use connection::Role;
pub use connection::NFDS;
pub use deadline::Deadline;
pub use dialer::Dialer;
pub use error::Error;
pub use error::ErrorCategory;
pub use listener::Listener;
pub use server::serve;
pub use server::AnsweredConnection;
pub use server::ConnectionSource;
pub use server::Server;
pub use socket::make_pipe;

pub use russ_wire::Attributes;
pub use russ_wire::Credentials;
pub use russ_wire::DecodeOptions;
pub use russ_wire::Request;
pub use russ_wire::WireError;
pub use russ_wire::PROTOCOL_STRING;

pub type Result<T> = std::result::Result<T, Error>;
