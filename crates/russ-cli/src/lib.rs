#![deny(clippy::all)]

pub mod commands;
pub mod echo;
pub mod error;
pub mod handlers;
pub mod signal_handler;
pub mod telemetry;

pub use commands::Cli;
pub use commands::Commands;
pub use error::CliError;
pub use handlers::HandlerResult;
