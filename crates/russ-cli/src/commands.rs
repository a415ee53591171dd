use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::ValueHint;

const AFTER_LONG_HELP: &str = r#"ADDRESSES:
    /path/to/socket          - Socket file, service path "/"
    /path/to/socket/a/b      - Socket file, service path "/a/b"
    +/name                   - Socket "name" under the services directory

EXAMPLES:
    # Run the echo service and talk to it
    russ serve /tmp/echo.sock &
    echo hello | russ dial /tmp/echo.sock echo
    russ info /tmp/echo.sock

    # Pass attributes and arguments
    russ dial -a user=alice /tmp/echo.sock info one two"#;

#[derive(Debug, Parser)]
#[command(name = "russ")]
#[command(author, version, propagate_version = true)]
#[command(about = "Dial and serve local services over Unix domain sockets")]
#[command(after_long_help = AFTER_LONG_HELP)]
#[command(subcommand_required = true, arg_required_else_help = true)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory that `+` addresses expand to
    #[arg(long, global = true, value_name = "DIR", env = "RUSS_SERVICES_DIR", value_hint = ValueHint::DirPath)]
    pub services_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Call an operation, wiring this process's stdio to the service
    #[command(after_long_help = "\
EXAMPLES:
    echo hello | russ dial /tmp/echo.sock echo
    russ dial -a lang=en --timeout 500 +/echo info extra args")]
    Dial {
        #[arg(value_name = "ADDR")]
        addr: String,

        #[arg(value_name = "OP")]
        op: String,

        #[arg(trailing_var_arg = true, value_name = "ARGS")]
        args: Vec<String>,

        /// Request attribute, repeatable
        #[arg(short = 'a', long = "attr", value_name = "KEY=VALUE", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,

        #[command(flatten)]
        timeout: TimeoutArg,
    },

    /// Print a service's usage text
    Help {
        #[arg(value_name = "ADDR")]
        addr: String,

        #[command(flatten)]
        timeout: TimeoutArg,
    },

    /// Print what a service reports about a call
    Info {
        #[arg(value_name = "ADDR")]
        addr: String,

        #[command(flatten)]
        timeout: TimeoutArg,
    },

    /// Print the operations a service offers
    List {
        #[arg(value_name = "ADDR")]
        addr: String,

        #[command(flatten)]
        timeout: TimeoutArg,
    },

    /// Announce the echo service at PATH and serve until interrupted
    Serve {
        #[arg(value_name = "PATH", value_hint = ValueHint::FilePath)]
        path: PathBuf,

        /// Socket permission bits, octal
        #[arg(long, default_value = "0600", value_parser = parse_mode)]
        mode: u32,

        /// Handler threads [default: 4]; 0 runs handlers on the answering thread
        #[arg(long, env = "RUSS_WORKERS")]
        workers: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, clap::Args)]
pub struct TimeoutArg {
    /// Timeout in milliseconds [default: RUSS_DIAL_TIMEOUT_MS or 30000]
    #[arg(long = "timeout", value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

impl TimeoutArg {
    pub fn or(self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

pub fn parse_attribute(s: &str) -> Result<(String, String), String> {
    russ::Attributes::parse_entry(s)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

pub fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("invalid octal mode '{}'", s)),
    }
}
