use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Keeps the background log writer alive; drop it last to flush.
#[derive(Debug)]
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

impl TelemetryGuard {
    fn disabled() -> Self {
        Self { _guard: None }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    /// Appended to through a background writer thread.
    File(PathBuf),
}

impl LogSink {
    /// `RUSS_LOG` names a log file; unset or empty means stderr.
    pub fn from_env() -> Self {
        Self::from_var(std::env::var_os("RUSS_LOG"))
    }

    fn from_var(value: Option<OsString>) -> Self {
        match value.filter(|v| !v.is_empty()) {
            Some(path) => LogSink::File(PathBuf::from(path)),
            None => LogSink::Stderr,
        }
    }
}

/// Filter used when `RUST_LOG` is unset. Verbose mode only opens up the
/// transport's own crates.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "warn,russ=debug,russ_cli=debug"
    } else {
        "warn"
    }
}

/// Falls back to stderr when the file cannot be opened.
fn open_log_writer(sink: &LogSink) -> (BoxMakeWriter, Option<WorkerGuard>) {
    let LogSink::File(path) = sink else {
        return (BoxMakeWriter::new(std::io::stderr), None);
    };
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        Err(err) => {
            eprintln!("Warning: cannot open log file {}: {}", path.display(), err);
            (BoxMakeWriter::new(std::io::stderr), None)
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let (writer, guard) = open_log_writer(&LogSink::from_env());

    // worker threads are named russ-worker-N
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .with_thread_names(true)
        .with_ansi(guard.is_none() && std::io::stderr().is_terminal())
        .with_writer(writer);

    if subscriber.try_init().is_err() {
        return TelemetryGuard::disabled();
    }
    TelemetryGuard { _guard: guard }
}
