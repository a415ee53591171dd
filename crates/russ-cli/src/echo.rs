//! The echo service run by `russ serve`.

use std::fs::File;
use std::io;
use std::io::Write;

use russ::Connection;
use russ::Credentials;
use russ::Request;
use serde::Serialize;
use tracing::warn;

use crate::error::CliError;

const STDIN: usize = 0;
const STDOUT: usize = 1;
const STDERR: usize = 2;

pub const OPERATIONS: &[(&str, &str)] = &[
    ("echo", "copy standard input to standard output"),
    ("help", "print this help"),
    ("info", "print the request and caller credentials as JSON"),
    ("list", "list operations"),
];

#[derive(Serialize)]
struct InfoReply<'a> {
    request: &'a Request,
    credentials: Credentials,
}

fn usage() -> String {
    let mut text = String::from("usage: russ dial <addr> <op> [args...]\n\noperations:\n");
    for (name, about) in OPERATIONS {
        text.push_str(&format!("  {:<6} {}\n", name, about));
    }
    text
}

fn slot(conn: &mut Connection, index: usize) -> Result<File, CliError> {
    conn.take_descriptor(index)?
        .map(File::from)
        .ok_or_else(|| CliError::Io(io::Error::new(io::ErrorKind::NotConnected, "slot closed")))
}

fn write_slot(conn: &mut Connection, index: usize, text: &str) -> Result<(), CliError> {
    let mut file = slot(conn, index)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

fn run_operation(conn: &mut Connection) -> Result<i32, CliError> {
    let request = conn.request()?.clone();
    match request.operation.as_str() {
        "echo" => {
            let mut input = slot(conn, STDIN)?;
            let mut output = slot(conn, STDOUT)?;
            io::copy(&mut input, &mut output)?;
        }
        "help" => write_slot(conn, STDOUT, &usage())?,
        "info" => {
            let reply = InfoReply {
                request: &request,
                credentials: conn.credentials()?,
            };
            let mut json = serde_json::to_string_pretty(&reply)?;
            json.push('\n');
            write_slot(conn, STDOUT, &json)?;
        }
        "list" => {
            let names: String = OPERATIONS
                .iter()
                .map(|(name, _)| format!("{}\n", name))
                .collect();
            write_slot(conn, STDOUT, &names)?;
        }
        other => {
            write_slot(
                conn,
                STDERR,
                &format!("error: unknown operation \"{}\"\n", other),
            )?;
            return Ok(1);
        }
    }
    Ok(0)
}

/// Service loop handler; returns the operation's exit status.
pub fn handle(conn: &mut Connection) -> i32 {
    match run_operation(conn) {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Echo operation failed");
            1
        }
    }
}
